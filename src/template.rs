//! The text-template DSL used by curl channels.
//!
//! Grammar (a deliberate subset of the classic `{{.Field}}` style):
//!
//! ```text
//! {{.Field}}                              substitution
//! {{if eq .Field "literal"}} … {{else}} … {{end}}
//! {{if ne .Field .Other}} … {{end}}
//! ```
//!
//! Fields resolve against a [`Context`]. Strings without `{{` skip parsing
//! entirely. Unknown fields, unclosed actions, and unbalanced `{{if}}`
//! blocks are render errors — a channel with a broken template fails loudly
//! rather than posting garbage.

use anyhow::{bail, Context as _, Result};

use crate::event::LoginEvent;
use crate::timeutil::DisplayZone;

/// Field resolution for template rendering.
pub trait Context: Sync {
    fn field(&self, name: &str) -> Option<String>;
}

/// The rendering view of one [`LoginEvent`].
pub struct EventContext<'a> {
    pub event: &'a LoginEvent,
    pub zone: &'a DisplayZone,
    pub host_ip: String,
}

impl<'a> EventContext<'a> {
    pub fn new(event: &'a LoginEvent, zone: &'a DisplayZone) -> Self {
        EventContext {
            event,
            zone,
            host_ip: crate::util::host_ip(),
        }
    }
}

impl Context for EventContext<'_> {
    fn field(&self, name: &str) -> Option<String> {
        let e = self.event;
        let value = match name {
            "Type" => e.kind.as_str().to_string(),
            "User" => e.user.clone(),
            "IP" => e.ip.clone(),
            "Port" => e.port.to_string(),
            "Method" => e.method.clone(),
            "Hostname" => e.hostname.clone(),
            "Timestamp" => self.zone.format_rfc3339(e.timestamp),
            "Location" => e.location.clone(),
            "LogPath" => e.log_path.clone(),
            "Message" => e.message.clone(),
            "HostIP" => self.host_ip.clone(),
            _ => return None,
        };
        Some(value)
    }
}

/// Render `text` against `ctx`. Template-free strings pass through as-is.
pub fn render(text: &str, ctx: &dyn Context) -> Result<String> {
    if !text.contains("{{") {
        return Ok(text.to_string());
    }
    let nodes = parse(text)?;
    let mut out = String::with_capacity(text.len());
    render_nodes(&nodes, ctx, &mut out)?;
    Ok(out)
}

#[derive(Debug)]
enum Node {
    Text(String),
    Field(String),
    If {
        cond: Cond,
        then: Vec<Node>,
        otherwise: Vec<Node>,
    },
}

#[derive(Debug)]
enum Cond {
    Eq(Operand, Operand),
    Ne(Operand, Operand),
}

#[derive(Debug)]
enum Operand {
    Field(String),
    Literal(String),
}

/// A raw action between `{{` and `}}`, or literal text.
enum Piece {
    Text(String),
    Action(String),
}

fn split_pieces(text: &str) -> Result<Vec<Piece>> {
    let mut pieces = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        if start > 0 {
            pieces.push(Piece::Text(rest[..start].to_string()));
        }
        let after = &rest[start + 2..];
        let end = after.find("}}").context("unclosed {{ in template")?;
        pieces.push(Piece::Action(after[..end].trim().to_string()));
        rest = &after[end + 2..];
    }
    if !rest.is_empty() {
        pieces.push(Piece::Text(rest.to_string()));
    }
    Ok(pieces)
}

fn parse(text: &str) -> Result<Vec<Node>> {
    let pieces = split_pieces(text)?;
    let mut iter = pieces.into_iter();
    let (nodes, terminator) = parse_block(&mut iter, false)?;
    if let Some(term) = terminator {
        bail!("unexpected {{{{{term}}}}} without matching {{{{if}}}}");
    }
    Ok(nodes)
}

/// Parse until `{{else}}`/`{{end}}` (when inside an if) or input end.
/// Returns the nodes and the terminator action seen, if any.
fn parse_block(
    iter: &mut impl Iterator<Item = Piece>,
    inside_if: bool,
) -> Result<(Vec<Node>, Option<String>)> {
    let mut nodes = Vec::new();

    while let Some(piece) = iter.next() {
        match piece {
            Piece::Text(t) => nodes.push(Node::Text(t)),
            Piece::Action(action) => {
                if action == "else" || action == "end" {
                    return Ok((nodes, Some(action)));
                }

                if let Some(rest) = action.strip_prefix("if ") {
                    let cond = parse_cond(rest.trim())?;
                    let (then, term) = parse_block(iter, true)?;
                    let (then, otherwise) = match term.as_deref() {
                        Some("else") => {
                            let (otherwise, term2) = parse_block(iter, true)?;
                            if term2.as_deref() != Some("end") {
                                bail!("{{{{else}}}} block not closed with {{{{end}}}}");
                            }
                            (then, otherwise)
                        }
                        Some("end") => (then, Vec::new()),
                        _ => bail!("{{{{if}}}} block not closed with {{{{end}}}}"),
                    };
                    nodes.push(Node::If { cond, then, otherwise });
                    continue;
                }

                if let Some(field) = action.strip_prefix('.') {
                    if field.is_empty() || !field.chars().all(|c| c.is_ascii_alphanumeric()) {
                        bail!("invalid field reference {{{{.{field}}}}}");
                    }
                    nodes.push(Node::Field(field.to_string()));
                    continue;
                }

                bail!("unsupported template action {action:?}");
            }
        }
    }

    if inside_if {
        bail!("{{{{if}}}} block not closed with {{{{end}}}}");
    }
    Ok((nodes, None))
}

fn parse_cond(s: &str) -> Result<Cond> {
    let (op, rest) = if let Some(rest) = s.strip_prefix("eq ") {
        ("eq", rest)
    } else if let Some(rest) = s.strip_prefix("ne ") {
        ("ne", rest)
    } else {
        bail!("unsupported condition {s:?} (use eq/ne)");
    };

    let operands = parse_operands(rest)?;
    if operands.len() != 2 {
        bail!("{op} takes exactly two operands, got {}", operands.len());
    }
    let mut operands = operands.into_iter();
    let a = operands.next().unwrap();
    let b = operands.next().unwrap();
    Ok(match op {
        "eq" => Cond::Eq(a, b),
        _ => Cond::Ne(a, b),
    })
}

fn parse_operands(s: &str) -> Result<Vec<Operand>> {
    let mut out = Vec::new();
    let mut chars = s.trim().chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '"' {
            chars.next();
            let mut lit = String::new();
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some(esc) => lit.push(esc),
                        None => bail!("unterminated string literal in condition"),
                    },
                    Some(ch) => lit.push(ch),
                    None => bail!("unterminated string literal in condition"),
                }
            }
            out.push(Operand::Literal(lit));
        } else if c == '.' {
            chars.next();
            let mut name = String::new();
            while let Some(&ch) = chars.peek() {
                if ch.is_ascii_alphanumeric() {
                    name.push(ch);
                    chars.next();
                } else {
                    break;
                }
            }
            if name.is_empty() {
                bail!("empty field reference in condition");
            }
            out.push(Operand::Field(name));
        } else {
            bail!("unexpected token in condition near {:?}", chars.collect::<String>());
        }
    }

    Ok(out)
}

fn render_nodes(nodes: &[Node], ctx: &dyn Context, out: &mut String) -> Result<()> {
    for node in nodes {
        match node {
            Node::Text(t) => out.push_str(t),
            Node::Field(name) => {
                let value = ctx
                    .field(name)
                    .with_context(|| format!("unknown template field .{name}"))?;
                out.push_str(&value);
            }
            Node::If { cond, then, otherwise } => {
                let branch = if eval_cond(cond, ctx)? { then } else { otherwise };
                render_nodes(branch, ctx, out)?;
            }
        }
    }
    Ok(())
}

fn eval_cond(cond: &Cond, ctx: &dyn Context) -> Result<bool> {
    let resolve = |op: &Operand| -> Result<String> {
        match op {
            Operand::Literal(s) => Ok(s.clone()),
            Operand::Field(name) => ctx
                .field(name)
                .with_context(|| format!("unknown template field .{name}")),
        }
    };
    Ok(match cond {
        Cond::Eq(a, b) => resolve(a)? == resolve(b)?,
        Cond::Ne(a, b) => resolve(a)? != resolve(b)?,
    })
}
