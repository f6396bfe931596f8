//! Git commit objects

use crate::error::{Error, Result};
use crate::oid::Oid;

/// Author or committer line: `Name <email> <unix-time> <+hhmm>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub name: String,
    pub email: String,
    /// Seconds since the Unix epoch
    pub time: i64,
    /// Offset from UTC in minutes
    pub tz_offset: i32,
}

impl Signature {
    pub fn new(name: impl Into<String>, email: impl Into<String>, time: i64, tz_offset: i32) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            time,
            tz_offset,
        }
    }

    fn encode(&self) -> String {
        let sign = if self.tz_offset < 0 { '-' } else { '+' };
        let abs = self.tz_offset.unsigned_abs();
        format!(
            "{} <{}> {} {}{:02}{:02}",
            self.name,
            self.email,
            self.time,
            sign,
            abs / 60,
            abs % 60
        )
    }

    fn decode(line: &str) -> Result<Self> {
        let bad = || Error::corrupt("commit", format!("malformed signature {line:?}"));
        let lt = line.find('<').ok_or_else(bad)?;
        let gt = line[lt..].find('>').map(|i| lt + i).ok_or_else(bad)?;
        let name = line[..lt].trim_end().to_string();
        let email = line[lt + 1..gt].to_string();

        let mut rest = line[gt + 1..].split_whitespace();
        let time: i64 = rest.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
        let tz = rest.next().ok_or_else(bad)?;
        if tz.len() != 5 || !tz.bytes().skip(1).all(|b| b.is_ascii_digit()) {
            return Err(bad());
        }
        let (sign, digits) = tz.split_at(1);
        let hours: i32 = digits[..2].parse().map_err(|_| bad())?;
        let minutes: i32 = digits[2..].parse().map_err(|_| bad())?;
        let magnitude = hours * 60 + minutes;
        let tz_offset = match sign {
            "+" => magnitude,
            "-" => -magnitude,
            _ => return Err(bad()),
        };
        Ok(Self {
            name,
            email,
            time,
            tz_offset,
        })
    }
}

/// A commit: root tree, parents, signatures and message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub tree: Oid,
    pub parents: Vec<Oid>,
    pub author: Signature,
    pub committer: Signature,
    /// Headers we do not interpret (`gpgsig`, `encoding`, ...), kept verbatim
    pub extra_headers: Vec<(String, String)>,
    pub message: String,
}

impl Commit {
    /// Encode as Git commit object content
    pub fn encode(&self) -> Vec<u8> {
        let mut out = String::new();
        out.push_str(&format!("tree {}\n", self.tree));
        for parent in &self.parents {
            out.push_str(&format!("parent {parent}\n"));
        }
        out.push_str(&format!("author {}\n", self.author.encode()));
        out.push_str(&format!("committer {}\n", self.committer.encode()));
        for (key, value) in &self.extra_headers {
            out.push_str(key);
            out.push(' ');
            // continuation lines are indented by one space
            out.push_str(&value.replace('\n', "\n "));
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.message);
        out.into_bytes()
    }

    /// Decode Git commit object content
    pub fn decode(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|_| Error::corrupt("commit", "not valid UTF-8"))?;
        let (headers, message) = match text.find("\n\n") {
            Some(i) => (&text[..i], &text[i + 2..]),
            None => (text.trim_end_matches('\n'), ""),
        };

        let mut tree = None;
        let mut parents = Vec::new();
        let mut author = None;
        let mut committer = None;
        let mut extra_headers: Vec<(String, String)> = Vec::new();

        for line in headers.lines() {
            if let Some(cont) = line.strip_prefix(' ') {
                let last = extra_headers
                    .last_mut()
                    .ok_or_else(|| Error::corrupt("commit", "continuation without header"))?;
                last.1.push('\n');
                last.1.push_str(cont);
                continue;
            }
            let (key, value) = line
                .split_once(' ')
                .ok_or_else(|| Error::corrupt("commit", format!("bad header line {line:?}")))?;
            match key {
                "tree" => tree = Some(Oid::from_hex(value)?),
                "parent" => parents.push(Oid::from_hex(value)?),
                "author" => author = Some(Signature::decode(value)?),
                "committer" => committer = Some(Signature::decode(value)?),
                _ => extra_headers.push((key.to_string(), value.to_string())),
            }
        }

        Ok(Self {
            tree: tree.ok_or_else(|| Error::corrupt("commit", "missing tree header"))?,
            parents,
            author: author.ok_or_else(|| Error::corrupt("commit", "missing author"))?,
            committer: committer.ok_or_else(|| Error::corrupt("commit", "missing committer"))?,
            extra_headers,
            message: message.to_string(),
        })
    }
}
