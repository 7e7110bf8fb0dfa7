use serde_json::{Value, json};

use crate::io_struct::StageItem;

/// Default number of pipeline stages (outline, five chapters, final review).
pub const DEFAULT_STAGE_COUNT: u32 = 7;

/// Generated text containing any of these markers fails validation so a
/// refused item does not poison the next stage.
const REFUSAL_MARKERS: &[&str] = &["I cannot", "As an AI"];

/// Where a stage's prompt content comes from: the original submission for
/// stage 1, the previous stage's raw output for every later stage.
#[derive(Debug, Clone, Copy)]
pub enum StageSource<'a> {
    Original { id: &'a str, topic: &'a str },
    Previous(&'a Value),
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Pull the generated text out of the batch output envelope.
///
/// Returns an empty string when the expected shape is absent; callers treat
/// empty as a validation failure, never as a reason to panic.
pub fn extract_text(raw_output: &Value) -> String {
    raw_output["prediction"]["candidates"][0]["content"]["parts"][0]["text"]
        .as_str()
        .unwrap_or("")
        .to_string()
}

/// Build the JSONL item for one stage. Pure: no I/O, no clock.
pub fn build_input_for_stage(stage: u32, final_stage: u32, source: StageSource) -> StageItem {
    let (custom_id, prompt_text) = match source {
        StageSource::Original { id, topic } => (
            id.to_string(),
            format!("Role: Editor. Task: Create a 5-chapter outline for '{topic}'. Output JSON only."),
        ),
        StageSource::Previous(prev) => {
            let custom_id = prev["custom_id"].as_str().unwrap_or("").to_string();
            let prev_text = extract_text(prev);
            let prompt = if stage == final_stage {
                format!(
                    "Role: Reviewer. Task: Final polish and format as JSON metadata.\nContext: {}...",
                    truncate_chars(&prev_text, 500)
                )
            } else if stage == 2 {
                format!("Role: Writer. Task: Write Chapter 1 based on outline:\n{prev_text}")
            } else {
                format!(
                    "Role: Writer. Task: Write Chapter {} continuing from previous content:\n{}...",
                    stage - 1,
                    truncate_chars(&prev_text, 200)
                )
            };
            (custom_id, prompt)
        }
    };

    StageItem {
        request: json!({
            "contents": [
                {"role": "user", "parts": [{"text": prompt_text}]}
            ]
        }),
        custom_id,
    }
}

/// Gate between stages: empty or refused output fails, everything else passes.
pub fn validate_output(_stage: u32, output_item: &Value) -> Result<(), &'static str> {
    let text = extract_text(output_item);
    if text.is_empty() {
        return Err("Empty text generated");
    }
    if REFUSAL_MARKERS.iter().any(|marker| text.contains(marker)) {
        return Err("Refusal detected");
    }
    Ok(())
}

/// Best-effort JSON recovery for model output: strips fenced-code-block
/// markers, narrows to the outermost `{...}` span, then parses.
///
/// Model output is unreliable input, so this returns `None` on parse
/// failure instead of an error.
pub fn clean_and_parse_json(text: &str) -> Option<Value> {
    if text.is_empty() {
        return Some(json!({}));
    }

    let cleaned = text
        .lines()
        .map(|line| {
            let line = line
                .strip_prefix("```json")
                .map(str::trim_start)
                .unwrap_or(line);
            line.strip_prefix("```").unwrap_or(line)
        })
        .collect::<Vec<_>>()
        .join("\n");

    let span = match (cleaned.find('{'), cleaned.rfind('}')) {
        (Some(start), Some(end)) if start <= end => &cleaned[start..=end],
        _ => cleaned.as_str(),
    };

    match serde_json::from_str(span) {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!(
                "JSON parse failed for text: {}...",
                truncate_chars(text, 50)
            );
            None
        }
    }
}
