// Release Notes Cache
// Turns raw release notes (markdown / HTML) into short plain text for prompts
// and memoizes the result per version

use indexmap::IndexMap;
use parking_lot::Mutex;
use regex::Regex;

use crate::auto_update::types::UpdateInfo;

/// Appended when notes were cut to fit the budget
pub const TRUNCATION_SUFFIX: &str = "\n\nSee the full release notes for more details.";

/// Shown when a release has no usable notes
pub const EMPTY_NOTES: &str = "No release notes provided for this version.";

const BULLET: &str = "• ";

/// Lines that carry no information for the user
const BOILERPLATE_MARKERS: &[&str] = &["what's changed", "what’s changed", "full changelog"];

pub struct ReleaseNotesCache {
    budget: usize,
    capacity: usize,
    entries: Mutex<IndexMap<String, String>>,
    block_break: Regex,
    list_item: Regex,
    tag: Regex,
    link: Regex,
    emphasis: Regex,
    numeric_entity: Regex,
    separator: Regex,
    ordered_item: Regex,
}

impl ReleaseNotesCache {
    pub fn new(budget: usize, capacity: usize) -> Self {
        Self {
            budget,
            capacity: capacity.max(1),
            entries: Mutex::new(IndexMap::new()),
            block_break: Regex::new(r"(?i)<br\s*/?>|</p>|</li>|</h[1-6]>|</div>")
                .expect("block break regex must compile"),
            list_item: Regex::new(r"(?i)<li[^>]*>").expect("list item regex must compile"),
            tag: Regex::new(r"<[^>]+>").expect("tag regex must compile"),
            link: Regex::new(r"\[([^\]]*)\]\([^)]*\)").expect("link regex must compile"),
            emphasis: Regex::new(r"\*\*|__|`").expect("emphasis regex must compile"),
            numeric_entity: Regex::new(r"&#(x[0-9a-fA-F]+|[0-9]+);")
                .expect("entity regex must compile"),
            separator: Regex::new(r"^[-*_=]{3,}$").expect("separator regex must compile"),
            ordered_item: Regex::new(r"^\d+[.)]\s").expect("ordered item regex must compile"),
        }
    }

    /// Formatted notes for `info`, computed once per version
    pub fn format(&self, info: &UpdateInfo) -> String {
        if let Some(cached) = self.entries.lock().get(&info.version) {
            return cached.clone();
        }

        let formatted = self.sanitize(info.release_notes.as_deref().unwrap_or(""));

        let mut entries = self.entries.lock();
        entries.insert(info.version.clone(), formatted.clone());
        while entries.len() > self.capacity {
            if let Some((evicted, _)) = entries.shift_remove_index(0) {
                log::debug!("[ReleaseNotesCache] Evicted notes for {}", evicted);
            }
        }

        formatted
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn contains(&self, version: &str) -> bool {
        self.entries.lock().contains_key(version)
    }

    /// Cached versions, oldest insertion first
    pub fn versions(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    fn sanitize(&self, raw: &str) -> String {
        let text = self.block_break.replace_all(raw, "\n");
        let text = self.list_item.replace_all(&text, "\n- ");
        let text = self.tag.replace_all(&text, "");
        let text = self.decode_entities(&text);
        let text = self.link.replace_all(&text, "$1");
        let text = self.emphasis.replace_all(&text, "");

        let lines: Vec<String> = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .filter(|line| !self.is_boilerplate(line))
            .map(|line| self.bullet(line))
            .collect();

        if lines.is_empty() {
            return EMPTY_NOTES.to_string();
        }

        self.truncate(&lines.join("\n"))
    }

    fn decode_entities(&self, text: &str) -> String {
        let decoded = self.numeric_entity.replace_all(text, |caps: &regex::Captures<'_>| {
            let code = &caps[1];
            let value = match code.strip_prefix('x') {
                Some(hex) => u32::from_str_radix(hex, 16).ok(),
                None => code.parse::<u32>().ok(),
            };
            value
                .and_then(char::from_u32)
                .map(String::from)
                .unwrap_or_default()
        });

        decoded
            .replace("&nbsp;", " ")
            .replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&quot;", "\"")
            .replace("&apos;", "'")
            .replace("&amp;", "&")
    }

    fn is_boilerplate(&self, line: &str) -> bool {
        if line.starts_with('#') || self.separator.is_match(line) {
            return true;
        }
        let lower = line.to_lowercase();
        BOILERPLATE_MARKERS.iter().any(|marker| lower.contains(marker))
    }

    fn bullet(&self, line: &str) -> String {
        for marker in ["- ", "* ", "+ ", BULLET] {
            if let Some(rest) = line.strip_prefix(marker) {
                return format!("{}{}", BULLET, rest.trim_start());
            }
        }
        if self.ordered_item.is_match(line) {
            return line.to_string();
        }
        format!("{}{}", BULLET, line)
    }

    /// Cut at the last line break, or failing that the last space, inside the budget
    fn truncate(&self, text: &str) -> String {
        if text.chars().count() <= self.budget {
            return text.to_string();
        }

        let head: String = text.chars().take(self.budget).collect();
        let ends_on_break = text.chars().nth(self.budget) == Some('\n');
        let cut = if ends_on_break {
            head.len()
        } else {
            head.rfind('\n')
                .or_else(|| head.rfind(' '))
                .unwrap_or(head.len())
        };

        format!("{}{}", head[..cut].trim_end(), TRUNCATION_SUFFIX)
    }
}
