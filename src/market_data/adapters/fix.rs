// FIX tag=value parsing. Accepts SOH-delimited wire text and the '|' form used in logs.

use serde::{Deserialize, Serialize};

use crate::engine::types::PipelineError;

pub const SOH: char = '\u{1}';

pub const TAG_MSG_TYPE: u32 = 35;
pub const TAG_SENDING_TIME: u32 = 52;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixMessage {
    pub fields: Vec<(u32, String)>,
}

impl FixMessage {
    pub fn parse(text: &str) -> Result<Self, PipelineError> {
        let delimiter = if text.contains(SOH) { SOH } else { '|' };
        let mut fields = Vec::new();
        for token in text.split(delimiter) {
            let token = token.trim_matches(|c: char| c == '\r' || c == '\n');
            if token.is_empty() {
                continue;
            }
            let (tag, value) = token
                .split_once('=')
                .ok_or_else(|| PipelineError::MalformedMessage(format!("FIX field without '=': {token:?}")))?;
            let tag: u32 = tag
                .trim()
                .parse()
                .map_err(|_| PipelineError::MalformedMessage(format!("non-numeric FIX tag: {tag:?}")))?;
            fields.push((tag, value.to_string()));
        }
        if fields.is_empty() {
            return Err(PipelineError::MalformedMessage("empty FIX message".into()));
        }
        Ok(Self { fields })
    }

    /// First occurrence of a tag.
    pub fn get(&self, tag: u32) -> Option<&str> {
        self.fields.iter().find(|(t, _)| *t == tag).map(|(_, v)| v.as_str())
    }

    pub fn msg_type(&self) -> Option<&str> {
        self.get(TAG_MSG_TYPE)
    }

    /// Splits a repeating group announced by `count_tag`. The first tag after the
    /// count field delimits each entry.
    pub fn repeating_group(&self, count_tag: u32) -> Vec<FixGroupEntry<'_>> {
        let start = match self.fields.iter().position(|(t, _)| *t == count_tag) {
            Some(pos) => pos,
            None => return Vec::new(),
        };
        let count: usize = self.fields[start].1.trim().parse().unwrap_or(0);
        let body = &self.fields[start + 1..];
        let delimiter = match body.first() {
            Some((tag, _)) if count > 0 => *tag,
            _ => return Vec::new(),
        };

        let mut entries: Vec<FixGroupEntry<'_>> = Vec::with_capacity(count);
        for (tag, value) in body {
            if *tag == delimiter {
                if entries.len() == count {
                    break;
                }
                entries.push(FixGroupEntry { fields: Vec::new() });
            }
            if let Some(current) = entries.last_mut() {
                current.fields.push((*tag, value.as_str()));
            }
        }
        entries
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixGroupEntry<'a> {
    pub fields: Vec<(u32, &'a str)>,
}

impl<'a> FixGroupEntry<'a> {
    pub fn get(&self, tag: u32) -> Option<&'a str> {
        self.fields.iter().find(|(t, _)| *t == tag).map(|(_, v)| *v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pipe_delimited() {
        let msg = FixMessage::parse("8=FIX.4.4|35=AE|571=T1|31=100.5|32=2|").unwrap();
        assert_eq!(msg.msg_type(), Some("AE"));
        assert_eq!(msg.get(571), Some("T1"));
        assert_eq!(msg.get(999), None);
    }

    #[test]
    fn test_parse_soh_delimited() {
        let text = "8=FIX.4.4\u{1}35=W\u{1}55=BTC/USD\u{1}";
        let msg = FixMessage::parse(text).unwrap();
        assert_eq!(msg.get(55), Some("BTC/USD"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(FixMessage::parse("").is_err());
        assert!(FixMessage::parse("35=W|garbage|").is_err());
        assert!(FixMessage::parse("abc=1|").is_err());
    }

    #[test]
    fn test_repeating_group() {
        let msg = FixMessage::parse(
            "35=W|55=ETH/USD|268=3|269=0|270=100|271=1|269=0|270=99|271=2|269=1|270=101|271=3|10=000|",
        )
        .unwrap();
        let entries = msg.repeating_group(268);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].get(270), Some("99"));
        assert_eq!(entries[2].get(269), Some("1"));
        // trailer stays attached to the last entry but does not open a new one
        assert_eq!(entries[2].get(10), Some("000"));
    }

    #[test]
    fn test_repeating_group_missing() {
        let msg = FixMessage::parse("35=W|55=ETH/USD|").unwrap();
        assert!(msg.repeating_group(268).is_empty());
    }
}
