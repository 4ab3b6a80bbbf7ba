//! Port number → category mapping and per-category summaries.

use crate::protobuf::meshtastic_generated::PortNum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Text,
    Position,
    NodeInfo,
    Telemetry,
    Routing,
    Admin,
    DetectionSensor,
    RangeTest,
    StoreForward,
    Unknown,
}

impl Category {
    pub const ALL: [Category; 10] = [
        Category::Text,
        Category::Position,
        Category::NodeInfo,
        Category::Telemetry,
        Category::Routing,
        Category::Admin,
        Category::DetectionSensor,
        Category::RangeTest,
        Category::StoreForward,
        Category::Unknown,
    ];

    /// Name of the `[filters]` switch controlling this category.
    pub fn filter_key(self) -> &'static str {
        match self {
            Category::Text => "text_messages",
            Category::Position => "position_updates",
            Category::NodeInfo => "node_info",
            Category::Telemetry => "telemetry",
            Category::Routing => "routing",
            Category::Admin => "admin",
            Category::DetectionSensor => "detection_sensor",
            Category::RangeTest => "range_test",
            Category::StoreForward => "store_forward",
            Category::Unknown => "unknown",
        }
    }
}

/// Total over every `i32`; unmapped ports are [`Category::Unknown`].
pub fn classify(port: i32) -> Category {
    match PortNum::try_from(port) {
        Ok(PortNum::TextMessageApp) => Category::Text,
        Ok(PortNum::PositionApp) => Category::Position,
        Ok(PortNum::NodeinfoApp) => Category::NodeInfo,
        Ok(PortNum::RoutingApp) => Category::Routing,
        Ok(PortNum::AdminApp) => Category::Admin,
        Ok(PortNum::DetectionSensorApp) => Category::DetectionSensor,
        Ok(PortNum::StoreForwardApp) => Category::StoreForward,
        Ok(PortNum::RangeTestApp) => Category::RangeTest,
        Ok(PortNum::TelemetryApp) => Category::Telemetry,
        _ => Category::Unknown,
    }
}

/// Body line for a packet, or `None` when there is nothing to forward
/// (blank text). Signal quality is appended by the formatter.
pub fn summarize(category: Category, port: i32, payload: &[u8]) -> Option<String> {
    let line = match category {
        Category::Text => {
            let text = String::from_utf8_lossy(payload);
            let text = text.trim();
            if text.is_empty() {
                return None;
            }
            format!("💬 {}", text)
        }
        Category::Position => "📍 Position update".to_string(),
        Category::NodeInfo => "ℹ️ Node info update".to_string(),
        Category::Telemetry => "📊 Telemetry data".to_string(),
        Category::Routing => "🔄 Routing message".to_string(),
        Category::Admin => "⚙️ Admin message".to_string(),
        Category::DetectionSensor => "🚨 Detection sensor".to_string(),
        Category::RangeTest => "📏 Range test".to_string(),
        Category::StoreForward => "💾 Store & Forward".to_string(),
        Category::Unknown => format!("❓ Unknown message (port {})", port),
    };
    Some(line)
}
