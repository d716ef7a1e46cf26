//! Node spec builders for the reference bench

use nodeacq_rs::types::{AccessLevel, DataType, NodeSpec, Scaling, SourceType};

/// Manual node with a starting value
pub fn manual(name: &str, initial: f64) -> NodeSpec {
    NodeSpec::new(name, node_id(name), SourceType::Manual)
        .with_initial_value(initial)
        .with_interval(50)
}

/// Deterministic simulation node
pub fn simulation(name: &str, kind: &str) -> NodeSpec {
    NodeSpec::new(name, node_id(name), SourceType::Simulation)
        .with_config("sim_type", kind)
        .with_config("min", 0)
        .with_config("max", 100)
        .with_config("seed", 7)
        .with_interval(50)
}

/// GPIO input node
pub fn gpio_input(name: &str, pin: u8) -> NodeSpec {
    NodeSpec::new(name, node_id(name), SourceType::DigitalIo)
        .with_data_type(DataType::Boolean)
        .with_config("pin", pin)
        .with_config("mode", "input")
        .with_interval(50)
}

/// Writable GPIO output node
pub fn gpio_output(name: &str, pin: u8) -> NodeSpec {
    NodeSpec::new(name, node_id(name), SourceType::DigitalIo)
        .with_data_type(DataType::Boolean)
        .with_access(AccessLevel::ReadWrite)
        .with_config("pin", pin)
        .with_config("mode", "output")
        .with_interval(50)
}

/// ADS1115 channel at the default address, gain 1
pub fn ads1115(name: &str, channel: u8) -> NodeSpec {
    NodeSpec::new(name, node_id(name), SourceType::AnalogChannel)
        .with_config("device", "ads1115")
        .with_config("channel", channel)
        .with_config("gain", 1)
        .with_config("i2c_address", 0x48)
        .with_interval(50)
}

/// ADS1115 channel scaled 0-3.3 V to 0-100 %
pub fn tank_level(name: &str, channel: u8) -> NodeSpec {
    ads1115(name, channel).with_scaling(Scaling::new(0.0, 100.0, "%"))
}

pub fn node_id(name: &str) -> String {
    format!("ns=2;s={}", name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders_fill_source_config() {
        let spec = tank_level("Tank", 1);
        assert_eq!(spec.node_id, "ns=2;s=Tank");
        assert_eq!(spec.source_type, SourceType::AnalogChannel);
        assert_eq!(spec.source_config["channel"], 1);
        assert!(spec.scaling.is_some());
    }
}
