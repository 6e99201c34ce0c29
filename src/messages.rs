use crate::fusion::Accuracy;
use serde::{Deserialize, Serialize};

/// One published channel value
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ValueMessage {
    /// Component that produced the value (e.g., "bme0")
    pub sensor_id: String,
    /// Channel name as configured (defaults to the output kind)
    pub channel: String,
    pub value: f32,
    /// Unit symbol, empty for unitless values
    pub unit: String,
    /// Decimal places consumers should display
    pub accuracy_decimals: u8,
    /// Fusion confidence, only present on fused channels
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub accuracy: Option<Accuracy>,
    /// Per-component sequence number for ordering
    pub seq: u64,
    /// Monotonic timestamp of the source sample in nanoseconds
    pub t_mono_ns: u64,
}

impl ValueMessage {
    /// Value rounded to the configured precision
    pub fn rounded(&self) -> f32 {
        let scale = 10f32.powi(self.accuracy_decimals as i32);
        (self.value * scale).round() / scale
    }

    /// Single-line JSON for log sinks
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(accuracy: Option<Accuracy>) -> ValueMessage {
        ValueMessage {
            sensor_id: "bme0".to_string(),
            channel: "iaq".to_string(),
            value: 42.37,
            unit: String::new(),
            accuracy_decimals: 0,
            accuracy,
            seq: 7,
            t_mono_ns: 3_000_000_000,
        }
    }

    #[test]
    fn test_rounded() {
        assert_eq!(message(None).rounded(), 42.0);
        let mut m = message(None);
        m.accuracy_decimals = 1;
        assert!((m.rounded() - 42.4).abs() < 1e-4);
    }

    #[test]
    fn test_json_serialization() {
        let json = message(Some(Accuracy::High)).to_json().unwrap();
        assert!(json.contains("\"sensor_id\":\"bme0\""));
        assert!(json.contains("\"accuracy\":3"));
        assert!(!json.contains('\n'));

        let raw = message(None).to_json().unwrap();
        assert!(!raw.contains("accuracy\":"));

        let decoded: ValueMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, message(Some(Accuracy::High)));
    }

    #[test]
    fn test_out_of_range_accuracy_is_rejected() {
        let json = message(Some(Accuracy::Low)).to_json().unwrap().replace("\"accuracy\":1", "\"accuracy\":4");
        assert!(serde_json::from_str::<ValueMessage>(&json).is_err());
    }
}
