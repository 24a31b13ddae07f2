use crate::types::Metric;

pub const DISCOVERY_PREFIX: &str = "homeassistant";

pub fn state_topic(device: &str, metric: Metric) -> String {
    format!("{device}/{}/state", metric.key())
}

pub fn discovery_topic(device: &str, metric: Metric) -> String {
    format!("{DISCOVERY_PREFIX}/sensor/{device}/{}/config", metric.key())
}

pub fn unique_id(device: &str, metric: Metric) -> String {
    format!("{}_{}", device.replace('-', "_"), metric.key())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_layout() {
        assert_eq!(
            state_topic("water-tank", Metric::WaterLevel),
            "water-tank/water_level/state"
        );
        assert_eq!(
            discovery_topic("water-tank", Metric::Volume),
            "homeassistant/sensor/water-tank/volume/config"
        );
        assert_eq!(unique_id("water-tank", Metric::Distance), "water_tank_distance");
    }
}
