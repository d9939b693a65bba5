// ============================================================================
// File: packages/ovbackup/src/config/ini.rs
// ----------------------------------------------------------------------------
// Minimal INI reader for the shell configuration file.
//
// Supports `[section]` headers, `key = value` and `key: value` pairs, and
// full-line `#` / `;` comments. Keys are case-insensitive; values are kept
// verbatim apart from surrounding whitespace.
// ============================================================================

use std::collections::HashMap;

/// Syntax error at a 1-based line number
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}: {message}")]
pub struct IniSyntaxError {
    pub line: usize,
    pub message: String,
}

/// Parsed INI document
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IniDocument {
    sections: HashMap<String, HashMap<String, String>>,
}

impl IniDocument {
    pub fn parse(text: &str) -> Result<Self, IniSyntaxError> {
        let mut document = Self::default();
        let mut current: Option<String> = None;

        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            let error = |message: &str| IniSyntaxError {
                line: index + 1,
                message: message.to_string(),
            };

            if let Some(header) = line.strip_prefix('[') {
                let name = header
                    .strip_suffix(']')
                    .ok_or_else(|| error("unterminated section header"))?
                    .trim();
                if name.is_empty() {
                    return Err(error("empty section name"));
                }
                document.sections.entry(name.to_string()).or_default();
                current = Some(name.to_string());
                continue;
            }

            let section = current
                .as_ref()
                .ok_or_else(|| error("key outside of any section"))?;
            let split = line
                .find(['=', ':'])
                .ok_or_else(|| error("expected 'key = value'"))?;
            let key = line[..split].trim().to_ascii_lowercase();
            if key.is_empty() {
                return Err(error("empty key"));
            }
            let value = line[split + 1..].trim().to_string();
            document
                .sections
                .entry(section.clone())
                .or_default()
                .insert(key, value);
        }
        Ok(document)
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.sections.contains_key(section)
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)?
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }
}
