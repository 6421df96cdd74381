//! Metric alarm evaluation, separate from actuation.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use cropdroid_core::farm_config::FarmConfig;
use cropdroid_core::model::Metric;
use cropdroid_core::types::{Notification, NotificationKind};

use crate::state::StateMap;

#[derive(Debug, Default)]
pub struct AlarmTracker {
    /// Metrics currently outside their alarm band.
    active: HashSet<u64>,
}

fn out_of_range(metric: &Metric, value: f64) -> Option<String> {
    if let Some(low) = metric.alarm_low.filter(|low| value < *low) {
        return Some(format!("{} is {value}{}, below {low}", metric.name, metric.unit));
    }
    if let Some(high) = metric.alarm_high.filter(|high| value > *high) {
        return Some(format!("{} is {value}{}, above {high}", metric.name, metric.unit));
    }
    None
}

impl AlarmTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self, metric_id: u64) -> bool {
        self.active.contains(&metric_id)
    }

    /// One `Alarm` per out-of-range metric per call, one `AlarmCleared` on the
    /// way back. Metrics with `notify = false` are tracked silently.
    pub fn evaluate(&mut self, config: &FarmConfig, state: &StateMap, now: DateTime<Utc>) -> Vec<Notification> {
        let mut out = Vec::new();
        for device in &config.devices {
            let Some(snapshot) = state.get(&device.device_type) else {
                continue;
            };
            for metric in &device.metrics {
                if !metric.enable {
                    self.active.remove(&metric.id);
                    continue;
                }
                let Some(value) = snapshot.metric(&metric.key) else {
                    continue;
                };
                match out_of_range(metric, value) {
                    Some(message) => {
                        self.active.insert(metric.id);
                        if metric.notify {
                            out.push(Notification::new(
                                config.farm_id(),
                                &device.device_type,
                                NotificationKind::Alarm,
                                message,
                                now,
                            ));
                        }
                    }
                    None => {
                        if self.active.remove(&metric.id) && metric.notify {
                            out.push(Notification::new(
                                config.farm_id(),
                                &device.device_type,
                                NotificationKind::AlarmCleared,
                                format!("{} back to normal at {value}{}", metric.name, metric.unit),
                                now,
                            ));
                        }
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{HUMIDITY, TEMP, graph, snapshot};

    fn config() -> FarmConfig {
        let mut config = graph();
        for m in &mut config.devices[0].metrics {
            if m.id == TEMP {
                m.alarm_low = Some(60.0);
                m.alarm_high = Some(85.0);
            }
            if m.id == HUMIDITY {
                m.alarm_high = Some(70.0);
                m.notify = false;
            }
        }
        config
    }

    fn room(temp: f64, humidity: f64) -> StateMap {
        let mut s = StateMap::new();
        s.insert(
            "room".into(),
            snapshot(&[("tempF0", temp), ("humidity0", humidity)], vec![0], Utc::now()),
        );
        s
    }

    #[test]
    fn test_alarm_each_tick_then_cleared_once() {
        let config = config();
        let mut alarms = AlarmTracker::new();
        let now = Utc::now();

        let first = alarms.evaluate(&config, &room(90.0, 50.0), now);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].kind, NotificationKind::Alarm);
        assert!(first[0].message.contains("above 85"));

        assert_eq!(alarms.evaluate(&config, &room(91.0, 50.0), now).len(), 1);

        let cleared = alarms.evaluate(&config, &room(75.0, 50.0), now);
        assert_eq!(cleared.len(), 1);
        assert_eq!(cleared[0].kind, NotificationKind::AlarmCleared);
        assert!(alarms.evaluate(&config, &room(75.0, 50.0), now).is_empty());
    }

    #[test]
    fn test_notify_false_tracks_silently() {
        let config = config();
        let mut alarms = AlarmTracker::new();
        assert!(alarms.evaluate(&config, &room(75.0, 80.0), Utc::now()).is_empty());
        assert!(alarms.is_active(HUMIDITY));
        assert!(alarms.evaluate(&config, &room(75.0, 50.0), Utc::now()).is_empty());
        assert!(!alarms.is_active(HUMIDITY));
    }
}
