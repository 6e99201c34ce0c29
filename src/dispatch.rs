//! Output channels and their subscribers.
//!
//! A component only owns channels for the output kinds it was configured
//! with. Each successful cycle publishes once per channel; fused channels
//! stay silent when fusion produced nothing.

use crate::fusion::{FusedOutput, FusedValue};
use crate::messages::ValueMessage;
use crate::sensors::RawSample;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Temperature,
    Humidity,
    Pressure,
    GasResistance,
    Iaq,
    Co2Equivalent,
    BreathVocEquivalent,
}

impl OutputKind {
    pub const ALL: [OutputKind; 7] = [
        OutputKind::Temperature,
        OutputKind::Humidity,
        OutputKind::Pressure,
        OutputKind::GasResistance,
        OutputKind::Iaq,
        OutputKind::Co2Equivalent,
        OutputKind::BreathVocEquivalent,
    ];

    pub fn name(self) -> &'static str {
        match self {
            OutputKind::Temperature => "temperature",
            OutputKind::Humidity => "humidity",
            OutputKind::Pressure => "pressure",
            OutputKind::GasResistance => "gas_resistance",
            OutputKind::Iaq => "iaq",
            OutputKind::Co2Equivalent => "co2_equivalent",
            OutputKind::BreathVocEquivalent => "breath_voc_equivalent",
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            OutputKind::Temperature => "°C",
            OutputKind::Humidity => "%",
            OutputKind::Pressure => "hPa",
            OutputKind::GasResistance => "Ω",
            OutputKind::Iaq => "",
            OutputKind::Co2Equivalent | OutputKind::BreathVocEquivalent => "ppm",
        }
    }

    pub fn default_decimals(self) -> u8 {
        match self {
            OutputKind::Temperature | OutputKind::Humidity | OutputKind::Pressure => 2,
            OutputKind::GasResistance | OutputKind::Iaq | OutputKind::Co2Equivalent => 0,
            OutputKind::BreathVocEquivalent => 2,
        }
    }

    /// Produced by the fusion library rather than read from the device
    pub fn is_fused(self) -> bool {
        matches!(
            self,
            OutputKind::Iaq | OutputKind::Co2Equivalent | OutputKind::BreathVocEquivalent
        )
    }

    fn raw_value(self, sample: &RawSample) -> Option<f32> {
        match self {
            OutputKind::Temperature => Some(sample.temperature),
            OutputKind::Humidity => Some(sample.humidity),
            OutputKind::Pressure => Some(sample.pressure),
            OutputKind::GasResistance => Some(sample.gas_resistance),
            _ => None,
        }
    }

    fn fused_value(self, fused: &FusedOutput) -> Option<FusedValue> {
        match self {
            OutputKind::Iaq => Some(fused.iaq),
            OutputKind::Co2Equivalent => Some(fused.co2_equivalent),
            OutputKind::BreathVocEquivalent => Some(fused.breath_voc_equivalent),
            _ => None,
        }
    }
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Subscriber of published values
pub trait ValueSink: Send + Sync {
    fn publish(&self, message: ValueMessage);
}

/// Fan-out sink; values published without subscribers are dropped.
#[derive(Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<ValueMessage>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ValueMessage> {
        self.tx.subscribe()
    }
}

impl ValueSink for BroadcastSink {
    fn publish(&self, message: ValueMessage) {
        if self.tx.send(message).is_err() {
            trace!("[dispatch] no subscribers, value dropped");
        }
    }
}

/// Binding of one output kind to a subscriber
#[derive(Clone)]
pub struct OutputChannel {
    pub kind: OutputKind,
    pub name: String,
    pub accuracy_decimals: u8,
    sink: Arc<dyn ValueSink>,
}

impl OutputChannel {
    pub fn new(kind: OutputKind, sink: Arc<dyn ValueSink>) -> Self {
        Self {
            kind,
            name: kind.name().to_string(),
            accuracy_decimals: kind.default_decimals(),
            sink,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_decimals(mut self, decimals: u8) -> Self {
        self.accuracy_decimals = decimals;
        self
    }
}

pub struct OutputDispatcher {
    sensor_id: String,
    channels: BTreeMap<OutputKind, OutputChannel>,
    seq: u64,
}

impl OutputDispatcher {
    pub fn new(sensor_id: impl Into<String>) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            channels: BTreeMap::new(),
            seq: 0,
        }
    }

    /// Replaces any channel already bound to the same kind.
    pub fn add_channel(&mut self, channel: OutputChannel) {
        self.channels.insert(channel.kind, channel);
    }

    pub fn has_fused_channels(&self) -> bool {
        self.channels.keys().any(|k| k.is_fused())
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Publish one cycle's values, returning how many were sent.
    pub fn dispatch(&mut self, sample: &RawSample, fused: Option<&FusedOutput>) -> usize {
        self.seq += 1;
        let t_mono_ns = sample.timestamp.as_nanos() as u64;
        let mut sent = 0;

        for channel in self.channels.values() {
            let (value, accuracy) = if channel.kind.is_fused() {
                match fused.and_then(|f| channel.kind.fused_value(f)) {
                    Some(v) => (v.value, Some(v.accuracy)),
                    None => continue,
                }
            } else {
                match channel.kind.raw_value(sample) {
                    Some(v) => (v, None),
                    None => continue,
                }
            };

            channel.sink.publish(ValueMessage {
                sensor_id: self.sensor_id.clone(),
                channel: channel.name.clone(),
                value,
                unit: channel.kind.unit().to_string(),
                accuracy_decimals: channel.accuracy_decimals,
                accuracy,
                seq: self.seq,
                t_mono_ns,
            });
            sent += 1;
        }

        debug!("[{}] dispatched {} value(s), seq={}", self.sensor_id, sent, self.seq);
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion::Accuracy;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        messages: Mutex<Vec<ValueMessage>>,
    }

    impl ValueSink for RecordingSink {
        fn publish(&self, message: ValueMessage) {
            self.messages.lock().unwrap().push(message);
        }
    }

    fn sample() -> RawSample {
        RawSample {
            temperature: 21.0,
            pressure: 1013.25,
            humidity: 45.0,
            gas_resistance: 250000.0,
            gas_valid: true,
            heater_stable: true,
            heater_step: 0,
            timestamp: Duration::from_millis(1500),
        }
    }

    fn fused() -> FusedOutput {
        let v = |value| FusedValue {
            value,
            accuracy: Accuracy::Medium,
        };
        FusedOutput {
            iaq: v(55.0),
            co2_equivalent: v(620.0),
            breath_voc_equivalent: v(0.83),
        }
    }

    #[test]
    fn test_only_configured_channels_publish() {
        let sink = Arc::new(RecordingSink::default());
        let mut dispatcher = OutputDispatcher::new("bme0");
        dispatcher.add_channel(OutputChannel::new(OutputKind::Temperature, sink.clone()));
        dispatcher.add_channel(OutputChannel::new(OutputKind::Iaq, sink.clone()));

        assert_eq!(dispatcher.dispatch(&sample(), Some(&fused())), 2);

        let messages = sink.messages.lock().unwrap();
        let channels: Vec<&str> = messages.iter().map(|m| m.channel.as_str()).collect();
        assert_eq!(channels, vec!["temperature", "iaq"]);
        assert_eq!(messages[0].value, 21.0);
        assert_eq!(messages[0].unit, "°C");
        assert_eq!(messages[0].accuracy, None);
        assert_eq!(messages[1].value, 55.0);
        assert_eq!(messages[1].accuracy, Some(Accuracy::Medium));
        assert_eq!(messages[1].t_mono_ns, 1_500_000_000);
    }

    #[test]
    fn test_fused_channels_skipped_without_fusion() {
        let sink = Arc::new(RecordingSink::default());
        let mut dispatcher = OutputDispatcher::new("bme0");
        for kind in OutputKind::ALL {
            dispatcher.add_channel(OutputChannel::new(kind, sink.clone()));
        }
        assert_eq!(dispatcher.dispatch(&sample(), None), 4);
        assert!(sink.messages.lock().unwrap().iter().all(|m| m.accuracy.is_none()));
    }

    #[test]
    fn test_channel_overrides_and_sequence() {
        let sink = Arc::new(RecordingSink::default());
        let mut dispatcher = OutputDispatcher::new("bme0");
        dispatcher.add_channel(
            OutputChannel::new(OutputKind::Pressure, sink.clone())
                .with_name("room_pressure")
                .with_decimals(1),
        );
        assert!(!dispatcher.has_fused_channels());
        dispatcher.dispatch(&sample(), None);
        dispatcher.dispatch(&sample(), None);

        let messages = sink.messages.lock().unwrap();
        assert_eq!(messages[0].channel, "room_pressure");
        assert_eq!(messages[0].accuracy_decimals, 1);
        assert_eq!(messages.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_broadcast_sink_delivers_to_subscribers() {
        let sink = BroadcastSink::new(16);
        let mut rx = sink.subscribe();
        let mut dispatcher = OutputDispatcher::new("bme0");
        dispatcher.add_channel(OutputChannel::new(OutputKind::Humidity, Arc::new(sink.clone())));
        dispatcher.dispatch(&sample(), None);

        let message = rx.recv().await.unwrap();
        assert_eq!(message.channel, "humidity");
        assert_eq!(message.value, 45.0);
    }

    #[test]
    fn test_kind_metadata() {
        assert_eq!(OutputKind::GasResistance.to_string(), "gas_resistance");
        assert_eq!(OutputKind::BreathVocEquivalent.default_decimals(), 2);
        assert_eq!(OutputKind::Co2Equivalent.unit(), "ppm");
        let kind: OutputKind = serde_json::from_str("\"co2_equivalent\"").unwrap();
        assert_eq!(kind, OutputKind::Co2Equivalent);
    }
}
