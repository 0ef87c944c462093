//! Deterministic token estimation
//!
//! Used when an upstream omits usage counts and for authorize-time quota /
//! TPM gating. Characters are weighted by class; a per-model multiplier
//! table calibrates the result. The same snapshot of weights is used at
//! authorize time and commit time, so the two estimates always agree.

use crate::canonical::{CanonicalRequest, ContentPart};
use crate::config::EstimatorConfig;

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x4E00..=0x9FFF      // CJK unified
        | 0x3400..=0x4DBF    // extension A
        | 0x3040..=0x30FF    // hiragana + katakana
        | 0xAC00..=0xD7AF    // hangul syllables
    )
}

fn calibration(cfg: &EstimatorConfig, model: &str) -> f64 {
    cfg.model_calibration
        .iter()
        .find(|c| !c.model_prefix.is_empty() && model.starts_with(&c.model_prefix))
        .map(|c| c.multiplier)
        .filter(|m| *m > 0.0)
        .unwrap_or(1.0)
}

/// Estimate the token count of a text fragment.
pub fn estimate_text(text: &str, cfg: &EstimatorConfig, model: &str) -> i64 {
    if text.is_empty() {
        return 0;
    }
    let mut weight = 0.0f64;
    for c in text.chars() {
        weight += if c.is_whitespace() {
            cfg.whitespace
        } else if c.is_ascii_digit() {
            cfg.digit
        } else if c.is_ascii_alphabetic() {
            cfg.ascii_word
        } else if c.is_ascii() {
            cfg.punctuation
        } else if is_cjk(c) {
            cfg.cjk
        } else {
            cfg.other
        };
    }
    let scaled = weight * calibration(cfg, model);
    (scaled.ceil() as i64).max(1)
}

/// Estimate prompt tokens for a whole canonical request: message content,
/// tool-call payloads and tool schemas all count.
pub fn estimate_request(req: &CanonicalRequest, cfg: &EstimatorConfig) -> i64 {
    let mut total = 0i64;
    for message in &req.messages {
        for part in &message.parts {
            total += match part {
                ContentPart::Text { text } => estimate_text(text, cfg, &req.model),
                // Images meter as a flat charge; providers bill them
                // per-tile, which the calibration table can absorb.
                ContentPart::ImageRef { .. } => 256,
                ContentPart::ToolCall { name, arguments, .. } => {
                    estimate_text(name, cfg, &req.model)
                        + estimate_text(&arguments.to_string(), cfg, &req.model)
                }
                ContentPart::ToolResult { content, .. } => {
                    estimate_text(content, cfg, &req.model)
                }
            };
        }
    }
    for tool in &req.tools {
        total += estimate_text(&tool.name, cfg, &req.model);
        total += estimate_text(&tool.parameters.to_string(), cfg, &req.model);
    }
    total.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelCalibration;

    fn cfg() -> EstimatorConfig {
        EstimatorConfig::default()
    }

    #[test]
    fn empty_text_is_zero() {
        assert_eq!(estimate_text("", &cfg(), "gpt-4o-mini"), 0);
    }

    #[test]
    fn deterministic() {
        let text = "The quick brown fox jumps over 13 lazy dogs.";
        let a = estimate_text(text, &cfg(), "gpt-4o-mini");
        let b = estimate_text(text, &cfg(), "gpt-4o-mini");
        assert_eq!(a, b);
        assert!(a > 0);
    }

    #[test]
    fn cjk_weighs_heavier_per_char() {
        let latin = estimate_text("hello world ok", &cfg(), "m");
        let cjk = estimate_text("你好世界你好世界你好世界你好", &cfg(), "m");
        assert!(cjk > latin);
    }

    #[test]
    fn calibration_multiplier_applies() {
        let mut calibrated = cfg();
        calibrated.model_calibration.push(ModelCalibration {
            model_prefix: "claude-".to_string(),
            multiplier: 2.0,
        });
        let base = estimate_text("some reasonably long sentence here", &calibrated, "gpt-4o");
        let doubled =
            estimate_text("some reasonably long sentence here", &calibrated, "claude-3-opus");
        assert!(doubled >= base * 2 - 1);
    }
}
