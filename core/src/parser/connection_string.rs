//! `key=value;key={nested;value}` connection strings with case-insensitive keys.

use super::ParserError;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionString {
    /// Keys are stored lowercased.
    values: BTreeMap<String, String>,
}

impl ConnectionString {
    pub fn parse(input: &str) -> Result<Self, ParserError> {
        let mut values = BTreeMap::new();
        for segment in split_top_level(input, ';')? {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            let (key, value) = segment.split_once('=').ok_or_else(|| {
                ParserError::InvalidConnectionString(format!("'{}' is not a key=value pair", segment))
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(ParserError::InvalidConnectionString(format!(
                    "empty key in '{}'",
                    segment
                )));
            }
            values.insert(key.to_ascii_lowercase(), unwrap_braces(value.trim()).to_string());
        }
        Ok(ConnectionString { values })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(&key.to_ascii_lowercase()).map(String::as_str)
    }

    /// The first of `keys` that is present.
    pub fn get_any(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|key| self.get(key))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Parses the value of `key` with `FromStr`.
    pub fn parse_value<T: FromStr>(&self, key: &str) -> Result<Option<T>, ParserError> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|_| ParserError::InvalidSetting {
                    key: key.to_string(),
                    value: raw.to_string(),
                }),
        }
    }

    pub fn parse_bool(&self, key: &str) -> Result<Option<bool>, ParserError> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(Some(true)),
                "false" | "0" | "no" | "off" => Ok(Some(false)),
                _ => Err(ParserError::InvalidSetting {
                    key: key.to_string(),
                    value: raw.to_string(),
                }),
            },
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl FromStr for ConnectionString {
    type Err = ParserError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConnectionString::parse(s)
    }
}

impl fmt::Display for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, value) in &self.values {
            if !first {
                write!(f, "; ")?;
            }
            first = false;
            if value.contains(';') || value.contains('=') {
                write!(f, "{}={{{}}}", key, value)?;
            } else {
                write!(f, "{}={}", key, value)?;
            }
        }
        Ok(())
    }
}

fn split_top_level(input: &str, separator: char) -> Result<Vec<&str>, ParserError> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;

    for (i, c) in input.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1).ok_or_else(|| {
                    ParserError::InvalidConnectionString(format!("unbalanced '}}' at offset {}", i))
                })?;
            }
            c if c == separator && depth == 0 => {
                parts.push(&input[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(ParserError::InvalidConnectionString(
            "unbalanced '{' in connection string".to_string(),
        ));
    }
    parts.push(&input[start..]);
    Ok(parts)
}

fn unwrap_braces(value: &str) -> &str {
    match value.strip_prefix('{').and_then(|v| v.strip_suffix('}')) {
        Some(inner) => inner.trim(),
        None => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_case_insensitive() {
        let cs = ConnectionString::parse("PhasorProtocol=IeeeC37_118V2; server = 10.0.0.5:4712 ;accessID=235").unwrap();
        assert_eq!(cs.get("phasorprotocol"), Some("IeeeC37_118V2"));
        assert_eq!(cs.get("SERVER"), Some("10.0.0.5:4712"));
        assert_eq!(cs.parse_value::<u16>("AccessId").unwrap(), Some(235));
        assert_eq!(cs.len(), 3);
    }

    #[test]
    fn test_nested_values_keep_their_separators() {
        let cs = ConnectionString::parse(
            "protocol=Udp; localport=4713; commandChannel={server=10.0.0.5:4712; interface={0.0.0.0}}",
        )
        .unwrap();
        let nested = ConnectionString::parse(cs.get("commandchannel").unwrap()).unwrap();
        assert_eq!(nested.get("server"), Some("10.0.0.5:4712"));
        assert_eq!(nested.get("interface"), Some("0.0.0.0"));
    }

    #[test]
    fn test_malformed_strings_are_rejected() {
        assert!(ConnectionString::parse("server=a; commandChannel={server=b").is_err());
        assert!(ConnectionString::parse("server=a}").is_err());
        assert!(ConnectionString::parse("justakey").is_err());
        assert!(ConnectionString::parse("=value").is_err());
        assert!(ConnectionString::parse(" ; ;").unwrap().is_empty());

        let cs = ConnectionString::parse("simulateTimestamp=maybe; port=x").unwrap();
        assert!(cs.parse_bool("simulatetimestamp").is_err());
        assert!(cs.parse_value::<u16>("port").is_err());
    }
}
