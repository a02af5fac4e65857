//! Recognition diagnostics: timing and counts for each stage.
//!
//! Every [`Recognizer::recognize`](crate::Recognizer::recognize) run that
//! completes collects these alongside its result. Timestamps come from
//! `web-time`; durations serialize as fractional seconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::segment::Segmentation;

/// Serde support for `std::time::Duration` as fractional seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom("duration seconds must be finite and non-negative")
        })
    }
}

/// Diagnostics for one recognition run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionDiagnostics {
    /// Making sure the classifier is ready.
    pub model: StageDiagnostics,
    /// Decoding and filtering the upload.
    pub preprocess: StageDiagnostics,
    /// Splitting the filtered raster into glyphs.
    pub segment: StageDiagnostics,
    /// Classifying every glyph.
    pub classify: StageDiagnostics,
    /// Wall-clock time of the whole run.
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
    /// Counts across all stages.
    pub summary: RecognitionSummary,
}

/// Duration and metrics of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDiagnostics {
    /// Wall-clock duration (seconds).
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    /// Stage-specific metrics.
    pub metrics: StageMetrics,
}

/// Stage-specific metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StageMetrics {
    /// Classifier readiness.
    Model {
        /// Whether the model was already cached when the run started.
        cached: bool,
    },
    /// Decode and filter.
    Preprocess {
        /// Size of the uploaded bytes.
        input_bytes: usize,
        /// Decoded width.
        input_width: u32,
        /// Decoded height.
        input_height: u32,
        /// Filtered width.
        output_width: u32,
        /// Filtered height.
        output_height: u32,
        /// Filtered pixels dark enough to count as ink.
        foreground_pixels: u64,
    },
    /// Segmentation.
    Segment {
        /// Strategy used.
        strategy: Segmentation,
        /// Glyphs found.
        glyph_count: usize,
    },
    /// Per-glyph classification.
    Classify {
        /// Glyphs classified.
        glyph_count: usize,
        /// Glyphs whose inference failed.
        failed_count: usize,
        /// Mean confidence over recognized glyphs, in percent.
        mean_confidence: f32,
    },
}

/// Aggregate counts for a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecognitionSummary {
    /// Decoded image width.
    pub image_width: u32,
    /// Decoded image height.
    pub image_height: u32,
    /// Glyphs segmented.
    pub glyph_count: usize,
    /// Glyphs reported as unrecognized.
    pub failed_glyph_count: usize,
}

impl RecognitionDiagnostics {
    /// Human-readable multi-line report.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("Recognition Diagnostics Report\n{}", "=".repeat(60)));
        lines.push(format!(
            "Image: {}x{}",
            self.summary.image_width, self.summary.image_height,
        ));
        let total_ms = duration_ms(self.total_duration);
        lines.push(format!("Total duration: {total_ms:.3}ms"));
        lines.push(String::new());

        lines.push(format!(
            "{:<16} {:>10} {:>10}  {}",
            "Stage", "Duration", "% Total", "Details"
        ));
        lines.push("-".repeat(72));

        let stages = [
            ("Model", &self.model),
            ("Preprocess", &self.preprocess),
            ("Segment", &self.segment),
            ("Classify", &self.classify),
        ];
        for (name, diag) in stages {
            let ms = duration_ms(diag.duration);
            let pct = if total_ms > 0.0 {
                ms / total_ms * 100.0
            } else {
                0.0
            };
            let details = format_metrics(&diag.metrics);
            lines.push(format!("{name:<16} {ms:>8.3}ms {pct:>9.1}%  {details}"));
        }

        lines.push(String::new());
        lines.push(format!(
            "Glyphs: {}  |  Unrecognized: {}",
            self.summary.glyph_count, self.summary.failed_glyph_count,
        ));

        lines.join("\n")
    }
}

fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

fn format_metrics(metrics: &StageMetrics) -> String {
    match metrics {
        StageMetrics::Model { cached: true } => "cached".to_owned(),
        StageMetrics::Model { cached: false } => "loaded or trained".to_owned(),
        StageMetrics::Preprocess {
            input_bytes,
            input_width,
            input_height,
            output_width,
            output_height,
            foreground_pixels,
        } => format!(
            "{input_bytes} bytes -> {input_width}x{input_height} -> {output_width}x{output_height}, {foreground_pixels} ink pixels"
        ),
        StageMetrics::Segment {
            strategy,
            glyph_count,
        } => format!("{strategy:?}: {glyph_count} glyphs"),
        StageMetrics::Classify {
            glyph_count,
            failed_count,
            mean_confidence,
        } => format!("{glyph_count} glyphs, {failed_count} failed, mean confidence {mean_confidence:.1}%"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample() -> RecognitionDiagnostics {
        let stage = |ms, metrics| StageDiagnostics {
            duration: Duration::from_millis(ms),
            metrics,
        };
        RecognitionDiagnostics {
            model: stage(5, StageMetrics::Model { cached: true }),
            preprocess: stage(
                20,
                StageMetrics::Preprocess {
                    input_bytes: 1000,
                    input_width: 100,
                    input_height: 50,
                    output_width: 300,
                    output_height: 150,
                    foreground_pixels: 420,
                },
            ),
            segment: stage(
                10,
                StageMetrics::Segment {
                    strategy: Segmentation::ConnectedComponents,
                    glyph_count: 3,
                },
            ),
            classify: stage(
                15,
                StageMetrics::Classify {
                    glyph_count: 3,
                    failed_count: 1,
                    mean_confidence: 88.5,
                },
            ),
            total_duration: Duration::from_millis(50),
            summary: RecognitionSummary {
                image_width: 100,
                image_height: 50,
                glyph_count: 3,
                failed_glyph_count: 1,
            },
        }
    }

    #[test]
    fn duration_ms_converts_correctly() {
        assert!((duration_ms(Duration::from_millis(1234)) - 1234.0).abs() < 0.01);
    }

    #[test]
    fn report_lists_every_stage() {
        let report = sample().report();
        for name in ["Model", "Preprocess", "Segment", "Classify"] {
            assert!(report.contains(name), "missing {name}:\n{report}");
        }
        assert!(report.contains("100x50 -> 300x150"));
        assert!(report.contains("Unrecognized: 1"));
    }

    #[test]
    fn durations_serialize_as_seconds() {
        let json = serde_json::to_value(sample()).unwrap();
        assert!((json["total_duration"].as_f64().unwrap() - 0.05).abs() < 1e-9);
        let back: RecognitionDiagnostics = serde_json::from_value(json).unwrap();
        assert_eq!(back.total_duration, Duration::from_millis(50));
    }

    #[test]
    fn negative_duration_is_rejected() {
        let mut json = serde_json::to_value(sample()).unwrap();
        json["total_duration"] = serde_json::json!(-1.0);
        assert!(serde_json::from_value::<RecognitionDiagnostics>(json).is_err());
    }
}
