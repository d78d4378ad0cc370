//! SPF macro strings (RFC 7208 section 7)
//!
//! Used for the explanation attached to failures and for `exists:` and
//! `include:` targets that carry macros.

use super::engine::EngineError;
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Values macros expand to
#[derive(Debug, Clone)]
pub struct MacroContext<'a> {
    pub sender: &'a str,
    pub local_part: &'a str,
    pub sender_domain: &'a str,
    /// Domain currently being evaluated
    pub domain: &'a str,
    pub ip: IpAddr,
    pub helo: Option<&'a str>,
    pub rec_dom: &'a str,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Literal(String),
    Macro {
        letter: char,
        url_escape: bool,
        keep: Option<usize>,
        reverse: bool,
        delimiters: String,
    },
}

/// A parsed macro string
#[derive(Debug, Clone, PartialEq)]
pub struct MacroString {
    tokens: Vec<Token>,
}

impl MacroString {
    /// Parse a macro string, rejecting unknown letters and bad escapes
    pub fn parse(input: &str) -> Result<Self, EngineError> {
        let mut tokens = Vec::new();
        let mut literal = String::new();
        let mut chars = input.chars().peekable();

        while let Some(c) = chars.next() {
            if c != '%' {
                literal.push(c);
                continue;
            }
            match chars.next() {
                Some('%') => literal.push('%'),
                Some('_') => literal.push(' '),
                Some('-') => literal.push_str("%20"),
                Some('{') => {
                    let mut body = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(ch) => body.push(ch),
                            None => {
                                return Err(EngineError::InvalidMacro(format!(
                                    "unterminated macro in {:?}",
                                    input
                                )))
                            }
                        }
                    }
                    if !literal.is_empty() {
                        tokens.push(Token::Literal(std::mem::take(&mut literal)));
                    }
                    tokens.push(parse_macro_body(&body)?);
                }
                other => {
                    return Err(EngineError::InvalidMacro(format!(
                        "bad escape %{} in {:?}",
                        other.map(String::from).unwrap_or_default(),
                        input
                    )))
                }
            }
        }

        if !literal.is_empty() {
            tokens.push(Token::Literal(literal));
        }

        Ok(Self { tokens })
    }

    /// Expand against a context
    pub fn expand(&self, ctx: &MacroContext<'_>) -> String {
        let mut out = String::new();
        for token in &self.tokens {
            match token {
                Token::Literal(text) => out.push_str(text),
                Token::Macro {
                    letter,
                    url_escape,
                    keep,
                    reverse,
                    delimiters,
                } => {
                    let value = macro_value(*letter, ctx);
                    let value = transform(&value, *keep, *reverse, delimiters);
                    if *url_escape {
                        out.push_str(&url_escape_str(&value));
                    } else {
                        out.push_str(&value);
                    }
                }
            }
        }
        out
    }
}

fn parse_macro_body(body: &str) -> Result<Token, EngineError> {
    let mut chars = body.chars();
    let letter = chars
        .next()
        .ok_or_else(|| EngineError::InvalidMacro("empty macro".to_string()))?;

    if !"slodipvhcrtSLODIPVHCRT".contains(letter) {
        return Err(EngineError::InvalidMacro(format!(
            "unknown macro letter {:?}",
            letter
        )));
    }

    let rest: String = chars.collect();
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    let mut tail = &rest[digits.len()..];

    let keep = if digits.is_empty() {
        None
    } else {
        match digits.parse::<usize>() {
            Ok(0) | Err(_) => {
                return Err(EngineError::InvalidMacro(format!(
                    "bad digit transformer in %{{{}}}",
                    body
                )))
            }
            Ok(n) => Some(n),
        }
    };

    let reverse = if let Some(stripped) = tail.strip_prefix(['r', 'R']) {
        tail = stripped;
        true
    } else {
        false
    };

    if let Some(bad) = tail.chars().find(|c| !".-+,/_=".contains(*c)) {
        return Err(EngineError::InvalidMacro(format!(
            "bad delimiter {:?} in %{{{}}}",
            bad, body
        )));
    }

    Ok(Token::Macro {
        letter: letter.to_ascii_lowercase(),
        url_escape: letter.is_ascii_uppercase(),
        keep,
        reverse,
        delimiters: tail.to_string(),
    })
}

fn macro_value(letter: char, ctx: &MacroContext<'_>) -> String {
    match letter {
        's' => ctx.sender.to_string(),
        'l' => ctx.local_part.to_string(),
        'o' => ctx.sender_domain.to_string(),
        'd' => ctx.domain.to_string(),
        'i' => dotted_ip(ctx.ip),
        'c' => ctx.ip.to_string(),
        'p' => "unknown".to_string(),
        'v' => match ctx.ip {
            IpAddr::V4(_) => "in-addr".to_string(),
            IpAddr::V6(_) => "ip6".to_string(),
        },
        'h' => ctx.helo.unwrap_or("unknown").to_string(),
        'r' => ctx.rec_dom.to_string(),
        't' => SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default()
            .to_string(),
        _ => String::new(),
    }
}

/// IPv4 as-is, IPv6 as dot-separated nibbles
fn dotted_ip(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => v6
            .octets()
            .iter()
            .flat_map(|b| [b >> 4, b & 0x0f])
            .map(|n| format!("{:x}", n))
            .collect::<Vec<_>>()
            .join("."),
    }
}

fn transform(value: &str, keep: Option<usize>, reverse: bool, delimiters: &str) -> String {
    if keep.is_none() && !reverse && delimiters.is_empty() {
        return value.to_string();
    }

    let delimiters = if delimiters.is_empty() { "." } else { delimiters };
    let mut parts: Vec<&str> = value.split(|c: char| delimiters.contains(c)).collect();
    if reverse {
        parts.reverse();
    }
    if let Some(n) = keep {
        if n < parts.len() {
            parts = parts.split_off(parts.len() - n);
        }
    }
    parts.join(".")
}

fn url_escape_str(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || b"-._~".contains(&byte) {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}
