//! Problem category detection.
//!
//! `CategoryClassifier` is the seam; `KeywordClassifier` is the default,
//! rule-based implementation. Each category owns a keyword set and a few
//! phrases. The category with the highest score wins; ties go to the
//! category listed first in `Category::ALL`.

use deskmate_shared::Category;
use std::collections::HashSet;

/// Anything that can map free text to a problem category.
pub trait CategoryClassifier: Send + Sync {
    fn classify(&self, text: &str) -> Category;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Normalize a word: strip punctuation and handle simple plurals
pub fn normalize_word(word: &str) -> String {
    let cleaned: String = word
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect();
    if cleaned.ends_with('s') && !cleaned.ends_with("ss") && cleaned.len() > 3 {
        cleaned[..cleaned.len() - 1].to_string()
    } else {
        cleaned
    }
}

/// Normalized, non-empty words of `text`.
pub fn words(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(normalize_word)
        .filter(|w| !w.is_empty())
        .collect()
}

struct CategoryRules {
    category: Category,
    keywords: HashSet<String>,
    phrases: Vec<&'static str>,
}

impl CategoryRules {
    fn new(category: Category, keywords: &[&str], phrases: Vec<&'static str>) -> Self {
        Self {
            category,
            keywords: keywords.iter().map(|k| normalize_word(k)).collect(),
            phrases,
        }
    }

    fn score(&self, words: &[String], lowered: &str) -> usize {
        let keyword_hits = words.iter().filter(|w| self.keywords.contains(*w)).count();
        let phrase_hits = self.phrases.iter().filter(|p| lowered.contains(*p)).count();
        keyword_hits + 2 * phrase_hits
    }
}

/// Keyword-table classifier.
pub struct KeywordClassifier {
    rules: Vec<CategoryRules>,
}

impl KeywordClassifier {
    pub fn new() -> Self {
        let rules = vec![
            CategoryRules::new(
                Category::Networking,
                &[
                    "wifi", "wireless", "internet", "network", "router", "modem", "ethernet",
                    "dns", "dhcp", "vpn", "hotspot", "connect", "connection", "connecting",
                    "disconnect", "disconnecting", "signal", "ip", "lan", "ping", "bandwidth",
                ],
                vec!["can't connect", "cannot connect", "no internet", "keeps dropping"],
            ),
            CategoryRules::new(
                Category::Performance,
                &[
                    "slow", "slowly", "sluggish", "laggy", "lag", "lagging", "freeze",
                    "freezing", "frozen", "freezes", "hang", "hanging", "unresponsive",
                    "performance", "spinning", "beachball", "cpu", "ram", "memory", "startup",
                ],
                vec!["spinning wheel", "beach ball", "takes forever", "task manager"],
            ),
            CategoryRules::new(
                Category::Os,
                &[
                    "windows", "macos", "linux", "update", "updates", "bsod", "crash",
                    "crashing", "password", "login", "account", "malware", "virus",
                    "infected", "email", "outlook", "boot", "software", "install",
                    "reinstall", "registry", "error", "reset",
                ],
                vec!["blue screen", "locked out", "forgot my password", "safe mode"],
            ),
            CategoryRules::new(
                Category::Peripherals,
                &[
                    "printer", "print", "printing", "scanner", "keyboard", "mouse", "monitor",
                    "webcam", "camera", "headphone", "headset", "speaker", "microphone",
                    "bluetooth", "usb", "trackpad", "touchpad",
                ],
                vec!["print queue", "paper jam", "second monitor"],
            ),
            CategoryRules::new(
                Category::Mobile,
                &[
                    "phone", "iphone", "android", "ios", "smartphone", "tablet", "ipad",
                    "app", "sim", "cellular", "mobile",
                ],
                vec!["app store", "play store", "mobile data"],
            ),
            CategoryRules::new(
                Category::Hardware,
                &[
                    "battery", "power", "charger", "charging", "adapter", "disk", "drive",
                    "ssd", "hdd", "fan", "overheating", "overheat", "hot", "screen",
                    "motherboard", "hardware", "format", "partition", "smoke", "burning",
                ],
                vec![
                    "hard drive",
                    "won't turn on",
                    "wont turn on",
                    "no power",
                    "turn on",
                ],
            ),
        ];
        Self { rules }
    }

    /// Score every category. Zero-score categories are omitted.
    pub fn scores(&self, text: &str) -> Vec<(Category, usize)> {
        let lowered = text.to_lowercase();
        let words = words(&lowered);
        self.rules
            .iter()
            .map(|r| (r.category, r.score(&words, &lowered)))
            .filter(|(_, score)| *score > 0)
            .collect()
    }
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl CategoryClassifier for KeywordClassifier {
    fn classify(&self, text: &str) -> Category {
        let mut best = (Category::Unknown, 0usize);
        // Strictly greater keeps the earlier category on ties.
        for (category, score) in self.scores(text) {
            if score > best.1 {
                best = (category, score);
            }
        }
        best.0
    }

    fn name(&self) -> &'static str {
        "keyword"
    }
}
