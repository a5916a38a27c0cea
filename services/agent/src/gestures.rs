//! Gesture tools the console agent exposes to the model.

use anyhow::bail;
use embody_core::tools::ToolDefinition;
use serde_json::json;
use tracing::info;

pub fn gesture_tools() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition::new(
            "wave_hand",
            "Wave a hand at the user, e.g. when greeting or saying goodbye.",
        )
        .with_fn(|_| async {
            info!("Gesture: wave_hand");
            Ok(json!("waved"))
        }),
        ToolDefinition::new("nod", "Nod the head to show agreement.")
            .with_parameters(json!({
                "type": "object",
                "properties": {
                    "times": { "type": "integer", "description": "How many nods.", "default": 1 }
                },
                "required": []
            }))
            .with_fn(|args| async move {
                let times = args.i64("times").unwrap_or(1).clamp(1, 5);
                info!(times, "Gesture: nod");
                Ok(json!({ "nodded": times }))
            }),
        ToolDefinition::new("look_at", "Turn the head to look at a target.")
            .with_parameters(json!({
                "type": "object",
                "properties": {
                    "target": {
                        "type": "string",
                        "description": "What to look at: user, left, right, up, down."
                    },
                    "duration_seconds": { "type": "number", "default": 2.0 }
                },
                "required": ["target"]
            }))
            .with_fn(|args| async move {
                let target = args.str("target").unwrap_or_default().trim().to_lowercase();
                if target.is_empty() {
                    bail!("look_at needs a target");
                }
                let duration = args.f64("duration_seconds").unwrap_or(2.0);
                info!(%target, duration, "Gesture: look_at");
                Ok(json!({ "looking_at": target, "duration_seconds": duration }))
            }),
    ]
}
