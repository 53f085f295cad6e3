//! Spoken-language detection for untagged audio streams.
//!
//! Short clips are extracted across the middle of the file and fed to the
//! external speech classifier. The per-clip answers are resolved by majority,
//! with ties broken by the clip nearest the midpoint. Detection is only
//! consulted when the container carries no language tag.

use av1_batch_config::LanguageConfig;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::probe::normalize_language_tag;
use crate::tools::Tools;

/// Answer returned when no clip produced a confident classification.
pub const UNKNOWN_LANGUAGE: &str = "unknown";

/// One classifier verdict for a single clip.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    /// Detected language code, normalized to three letters where known.
    pub language: String,
    /// Classifier confidence in [0, 1].
    pub confidence: f64,
}

/// Black-box speech classifier. The production implementation shells out to
/// a whisper-style CLI; tests inject canned verdicts.
pub trait LanguageClassifier: Send + Sync {
    fn classify(&self, clip: &Path) -> Option<Classification>;
}

/// Classifier backed by a whisper-style command-line tool. Expects a line of
/// the form `detected language: en (p = 0.95)` on either output channel.
pub struct WhisperClassifier {
    tools: Arc<Tools>,
}

impl WhisperClassifier {
    pub fn new(tools: Arc<Tools>) -> Self {
        Self { tools }
    }
}

impl LanguageClassifier for WhisperClassifier {
    fn classify(&self, clip: &Path) -> Option<Classification> {
        let output = match self.tools.classify_language(clip) {
            Ok(out) if out.success() => out,
            Ok(out) => {
                warn!(exit_code = out.exit_code, "language classifier failed");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "language classifier could not be spawned");
                return None;
            }
        };

        let combined = format!("{}\n{}", output.stdout, output.stderr);
        parse_classifier_output(&combined)
    }
}

/// Parses `detected language: <code> (p = <float>)` out of classifier output.
pub fn parse_classifier_output(text: &str) -> Option<Classification> {
    let lower = text.to_lowercase();
    let marker = "detected language:";
    let at = lower.find(marker)? + marker.len();
    let rest = lower[at..].trim_start();

    let code: String = rest
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect();
    if code.is_empty() {
        return None;
    }

    let confidence = rest
        .find("p =")
        .or_else(|| rest.find("p="))
        .and_then(|p| {
            let tail = rest[p..].trim_start_matches(|c: char| !c.is_ascii_digit());
            let num: String = tail
                .chars()
                .take_while(|c| c.is_ascii_digit() || *c == '.')
                .collect();
            num.parse::<f64>().ok()
        })
        .unwrap_or(0.0);

    Some(Classification {
        language: normalize_language_tag(&code),
        confidence,
    })
}

/// Detects the dominant spoken language of one audio stream.
pub struct LanguageDetector {
    tools: Arc<Tools>,
    classifier: Arc<dyn LanguageClassifier>,
    cfg: LanguageConfig,
}

impl LanguageDetector {
    pub fn new(tools: Arc<Tools>, cfg: LanguageConfig) -> Self {
        let classifier = Arc::new(WhisperClassifier::new(tools.clone()));
        Self::with_classifier(tools, cfg, classifier)
    }

    pub fn with_classifier(
        tools: Arc<Tools>,
        cfg: LanguageConfig,
        classifier: Arc<dyn LanguageClassifier>,
    ) -> Self {
        Self {
            tools,
            classifier,
            cfg,
        }
    }

    /// Detect the language of `stream_index` in `path`, sampling across the
    /// middle of `duration_seconds`. Returns [`UNKNOWN_LANGUAGE`] when every
    /// clip fails extraction or classifies below the confidence floor.
    pub fn detect(
        &self,
        path: &Path,
        stream_index: u32,
        duration_seconds: f64,
        temp_dir: Option<&Path>,
    ) -> String {
        let offsets = clip_offsets(
            duration_seconds,
            self.cfg.clips,
            self.cfg.clip_seconds,
            self.cfg.edge_skip_percent,
        );
        if offsets.is_empty() {
            return UNKNOWN_LANGUAGE.to_string();
        }

        let scratch = match temp_dir {
            Some(dir) => tempfile::Builder::new().prefix(".tmp-lang-").tempdir_in(dir),
            None => tempfile::Builder::new().prefix(".tmp-lang-").tempdir(),
        };
        let scratch = match scratch {
            Ok(dir) => dir,
            Err(e) => {
                warn!(error = %e, "could not create language scratch dir");
                return UNKNOWN_LANGUAGE.to_string();
            }
        };

        let mut verdicts: Vec<Option<Classification>> = Vec::with_capacity(offsets.len());
        for (i, start) in offsets.iter().enumerate() {
            let clip = scratch.path().join(format!("clip_{}.wav", i));
            let extracted = self
                .tools
                .extract_clip(path, stream_index, *start, self.cfg.clip_seconds, &clip)
                .map(|out| out.success())
                .unwrap_or(false);
            if !extracted {
                verdicts.push(None);
                continue;
            }
            let verdict = self
                .classifier
                .classify(&clip)
                .filter(|c| c.confidence >= self.cfg.min_confidence);
            debug!(clip = i, ?verdict, "language clip classified");
            verdicts.push(verdict);
        }

        resolve_majority(&verdicts, &offsets, duration_seconds)
    }
}

/// Clip start offsets, evenly spaced across the middle of the duration with
/// the first and last `edge_skip_percent` excluded. Short inputs collapse to
/// a single centered clip.
pub fn clip_offsets(
    duration_seconds: f64,
    clips: u32,
    clip_seconds: u32,
    edge_skip_percent: f64,
) -> Vec<u64> {
    if duration_seconds <= 0.0 || clips == 0 {
        return Vec::new();
    }

    let edge = duration_seconds * edge_skip_percent / 100.0;
    let usable = duration_seconds - 2.0 * edge - clip_seconds as f64;

    if usable <= 0.0 || duration_seconds < (clips * clip_seconds) as f64 {
        // Too short to spread clips: one clip centered on the midpoint.
        let start = ((duration_seconds - clip_seconds as f64) / 2.0).max(0.0);
        return vec![start as u64];
    }

    if clips == 1 {
        return vec![(edge + usable / 2.0) as u64];
    }

    (0..clips)
        .map(|i| {
            let progress = i as f64 / (clips - 1) as f64;
            (edge + usable * progress) as u64
        })
        .collect()
}

/// Majority vote over the confident verdicts; ties go to the clip whose
/// offset is nearest the midpoint of the file.
fn resolve_majority(
    verdicts: &[Option<Classification>],
    offsets: &[u64],
    duration_seconds: f64,
) -> String {
    let mut counts: Vec<(String, usize)> = Vec::new();
    for verdict in verdicts.iter().flatten() {
        match counts.iter_mut().find(|(lang, _)| *lang == verdict.language) {
            Some((_, n)) => *n += 1,
            None => counts.push((verdict.language.clone(), 1)),
        }
    }

    let best_count = match counts.iter().map(|(_, n)| *n).max() {
        Some(n) => n,
        None => return UNKNOWN_LANGUAGE.to_string(),
    };
    let leaders: Vec<&str> = counts
        .iter()
        .filter(|(_, n)| *n == best_count)
        .map(|(lang, _)| lang.as_str())
        .collect();

    if leaders.len() == 1 {
        return leaders[0].to_string();
    }

    // Tie: walk clips by distance from the midpoint and take the first
    // confident verdict among the tied languages.
    let midpoint = duration_seconds / 2.0;
    let mut order: Vec<usize> = (0..verdicts.len()).collect();
    order.sort_by(|a, b| {
        let da = (offsets[*a] as f64 - midpoint).abs();
        let db = (offsets[*b] as f64 - midpoint).abs();
        da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
    });
    for i in order {
        if let Some(v) = &verdicts[i] {
            if leaders.contains(&v.language.as_str()) {
                return v.language.clone();
            }
        }
    }
    UNKNOWN_LANGUAGE.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdict(lang: &str, confidence: f64) -> Option<Classification> {
        Some(Classification {
            language: lang.to_string(),
            confidence,
        })
    }

    #[test]
    fn test_parse_classifier_output() {
        let parsed =
            parse_classifier_output("whisper_init done\nauto-detected language: en (p = 0.953421)")
                .unwrap();
        assert_eq!(parsed.language, "eng");
        assert!((parsed.confidence - 0.953421).abs() < 1e-6);
    }

    #[test]
    fn test_parse_classifier_output_without_confidence() {
        let parsed = parse_classifier_output("detected language: ja").unwrap();
        assert_eq!(parsed.language, "jpn");
        assert_eq!(parsed.confidence, 0.0);
    }

    #[test]
    fn test_parse_classifier_output_garbage() {
        assert_eq!(parse_classifier_output("no language here"), None);
        assert_eq!(parse_classifier_output("detected language: 42"), None);
    }

    #[test]
    fn test_clip_offsets_spread_across_middle() {
        // 1000 s, 3 clips of 20 s, 5% edges: usable span is 50..930
        let offsets = clip_offsets(1000.0, 3, 20, 5.0);
        assert_eq!(offsets.len(), 3);
        assert_eq!(offsets[0], 50);
        assert_eq!(offsets[2], 930);
        assert!(offsets[0] < offsets[1] && offsets[1] < offsets[2]);
        // strictly inside the trimmed range
        assert!(*offsets.last().unwrap() + 20 <= 950);
    }

    #[test]
    fn test_clip_offsets_short_input_collapses_to_one() {
        let offsets = clip_offsets(50.0, 3, 20, 5.0);
        assert_eq!(offsets.len(), 1);
        assert_eq!(offsets[0], 15); // centered: (50 - 20) / 2
    }

    #[test]
    fn test_clip_offsets_zero_duration() {
        assert!(clip_offsets(0.0, 3, 20, 5.0).is_empty());
    }

    #[test]
    fn test_majority_wins() {
        let verdicts = vec![verdict("jpn", 0.9), verdict("eng", 0.8), verdict("jpn", 0.7)];
        let offsets = vec![100, 500, 900];
        assert_eq!(resolve_majority(&verdicts, &offsets, 1000.0), "jpn");
    }

    #[test]
    fn test_tie_broken_by_midpoint_clip() {
        // One vote each; the clip at 500 is nearest the midpoint of 1000 s.
        let verdicts = vec![verdict("jpn", 0.9), verdict("eng", 0.9)];
        let offsets = vec![100, 500];
        assert_eq!(resolve_majority(&verdicts, &offsets, 1000.0), "eng");
    }

    #[test]
    fn test_all_failed_is_unknown() {
        let verdicts: Vec<Option<Classification>> = vec![None, None, None];
        let offsets = vec![100, 500, 900];
        assert_eq!(
            resolve_majority(&verdicts, &offsets, 1000.0),
            UNKNOWN_LANGUAGE
        );
    }
}
