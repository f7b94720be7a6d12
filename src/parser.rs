//! Playbook source parser / agent-class builder (C6).
//!
//! A line/character scan with explicit state, no external
//! parser-combinator or regex dependency: the one expression-evaluation
//! dependency already pulled in (`evalexpr`) covers expression evaluation,
//! not source-file structure, so that's not reused here.

use crate::agent::{
    AgentClassHeader, AgentType, AiAgentClass, DeliveryChannel, DeliveryPreferences,
    HumanAgentClass, MeetingNotifications, Param, Playbook, PlaybookKind, RemoteAgentClass,
    RemoteTransport,
};
use crate::error::BuilderError;
use crate::identifiers::AgentID;
use crate::triggers::{compile_trigger, TriggerSpec};
use std::collections::HashMap;

/// Parses `# Name[:Type]` into the declared name and [`AgentType`]
/// (default `AI` when `:Type` is absent).
pub fn parse_agent_header(line: &str) -> Result<(String, AgentType), BuilderError> {
    let rest = line
        .strip_prefix("# ")
        .ok_or_else(|| BuilderError::ParseError(format!("not an H1 line: {:?}", line)))?
        .trim();
    if rest.is_empty() {
        return Err(BuilderError::ParseError("empty agent header".into()));
    }
    match rest.split_once(':') {
        Some((name, type_str)) => {
            let name = name.trim().to_string();
            let type_str = type_str.trim();
            let agent_type = AgentType::parse(type_str)
                .ok_or_else(|| BuilderError::UnknownAgentType(type_str.to_string()))?;
            Ok((name, agent_type))
        }
        None => Ok((rest.to_string(), AgentType::Ai)),
    }
}

/// Parses an H2 playbook header `## Name[($p1, $p2=default, ...)]` into the
/// name and parameter list.
fn parse_playbook_header(line: &str) -> Result<(String, Vec<Param>), BuilderError> {
    let rest = line
        .strip_prefix("## ")
        .ok_or_else(|| BuilderError::ParseError(format!("not an H2 line: {:?}", line)))?
        .trim();
    match rest.find('(') {
        None => Ok((rest.to_string(), Vec::new())),
        Some(open) => {
            let name = rest[..open].trim().to_string();
            let close = rest
                .rfind(')')
                .ok_or_else(|| BuilderError::ParseError(format!("unterminated params: {:?}", line)))?;
            let params_str = &rest[open + 1..close];
            let params = if params_str.trim().is_empty() {
                Vec::new()
            } else {
                params_str
                    .split(',')
                    .map(|p| {
                        let p = p.trim().trim_start_matches('$');
                        match p.split_once('=') {
                            Some((n, d)) => Param {
                                name: n.trim().to_string(),
                                default: Some(d.trim().to_string()),
                            },
                            None => Param {
                                name: p.to_string(),
                                default: None,
                            },
                        }
                    })
                    .collect()
            };
            Ok((name, params))
        }
    }
}

fn parse_bullets(lines: &[&str]) -> Vec<String> {
    lines
        .iter()
        .filter_map(|l| {
            let t = l.trim();
            t.strip_prefix("- ")
                .or_else(|| t.strip_prefix("* "))
                .map(|s| s.trim().to_string())
        })
        .collect()
}

fn parse_metadata_block(lines: &[&str]) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in lines {
        let t = line.trim();
        if t.is_empty() {
            continue;
        }
        if let Some((k, v)) = t.split_once(':') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

fn parse_list_field(value: &str) -> Vec<AgentID> {
    value
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(AgentID::new)
        .collect()
}

struct RawPlaybook {
    name: String,
    params: Vec<Param>,
    is_meeting: bool,
    is_public: bool,
    required_attendees: Vec<AgentID>,
    triggers: Vec<String>,
    description: String,
    steps_body: String,
}

fn parse_h2_block(header_line: &str, body_lines: &[&str]) -> Result<RawPlaybook, BuilderError> {
    let (name, params) = parse_playbook_header(header_line)?;
    let mut is_meeting = false;
    let mut is_public = false;
    let mut required_attendees = Vec::new();
    let mut triggers = Vec::new();
    let mut description_lines = Vec::new();
    let mut steps_lines: Vec<String> = Vec::new();

    let mut i = 0;
    let mut seen_structured_section = false;
    while i < body_lines.len() {
        let line = body_lines[i];
        let trimmed = line.trim();
        if trimmed.starts_with("### Triggers") {
            i += 1;
            let start = i;
            while i < body_lines.len() && !body_lines[i].trim_start().starts_with("###") {
                i += 1;
            }
            triggers = parse_bullets(&body_lines[start..i]);
            seen_structured_section = true;
            continue;
        }
        if trimmed.starts_with("### Steps") {
            i += 1;
            let start = i;
            while i < body_lines.len() && !body_lines[i].trim_start().starts_with("###") {
                i += 1;
            }
            steps_lines = body_lines[start..i].iter().map(|s| s.to_string()).collect();
            seen_structured_section = true;
            continue;
        }
        if trimmed.starts_with("### Notes") {
            i += 1;
            while i < body_lines.len() && !body_lines[i].trim_start().starts_with("###") {
                i += 1;
            }
            seen_structured_section = true;
            continue;
        }
        if trimmed == "meeting: true" {
            is_meeting = true;
        } else if trimmed == "public: true" {
            is_public = true;
        } else if let Some(v) = trimmed.strip_prefix("required_attendees:") {
            required_attendees = parse_list_field(v);
        } else if !trimmed.is_empty() && !seen_structured_section {
            description_lines.push(trimmed.to_string());
        }
        i += 1;
    }

    Ok(RawPlaybook {
        name,
        params,
        is_meeting,
        is_public,
        required_attendees,
        triggers,
        description: description_lines.join(" "),
        steps_body: steps_lines.join("\n"),
    })
}

fn compile_playbook(raw: RawPlaybook) -> Result<Playbook, BuilderError> {
    let mut triggers = Vec::with_capacity(raw.triggers.len());
    for (i, descriptor) in raw.triggers.iter().enumerate() {
        triggers.push(compile_trigger(descriptor, &raw.name, i)?);
    }
    Ok(Playbook {
        name: raw.name,
        params: raw.params,
        kind: PlaybookKind::Markdown,
        body: raw.steps_body,
        is_public: raw.is_public,
        is_meeting: raw.is_meeting,
        required_attendees: raw.required_attendees,
        optional_attendees: Vec::new(),
        triggers,
        description: raw.description,
    })
}

/// Extracts fenced code blocks (```lang ... ```) in `body`, returning each
/// block's raw content as a native (embedded-code) playbook named after its
/// first line if it looks like `fn name(...)`/`def name(...)`, else a
/// positional `native_N` name.
fn parse_native_playbooks(body_lines: &[&str]) -> Vec<Playbook> {
    let mut out = Vec::new();
    let mut i = 0;
    let mut counter = 0;
    while i < body_lines.len() {
        let line = body_lines[i].trim_start();
        if line.starts_with("```") {
            let start = i + 1;
            let mut end = start;
            while end < body_lines.len() && !body_lines[end].trim_start().starts_with("```") {
                end += 1;
            }
            let code_lines = &body_lines[start..end];
            let code = code_lines.join("\n");
            let name = code_lines
                .iter()
                .find_map(|l| {
                    let t = l.trim();
                    for prefix in ["fn ", "def ", "pub fn "] {
                        if let Some(rest) = t.strip_prefix(prefix) {
                            if let Some(paren) = rest.find('(') {
                                return Some(rest[..paren].trim().to_string());
                            }
                        }
                    }
                    None
                })
                .unwrap_or_else(|| {
                    counter += 1;
                    format!("native_{}", counter)
                });
            out.push(Playbook {
                name,
                params: Vec::new(),
                kind: PlaybookKind::EmbeddedCode,
                body: code,
                is_public: false,
                is_meeting: false,
                required_attendees: Vec::new(),
                optional_attendees: Vec::new(),
                triggers: Vec::new(),
                description: String::new(),
            });
            i = end + 1;
        } else {
            i += 1;
        }
    }
    out
}

/// Builds agent classes from complete playbook source (§4.6). Fails with
/// [`BuilderError::DuplicateAgentName`] if two H1 sections declare the same
/// name.
pub fn build_classes(source: &str) -> Result<HashMap<String, crate::agent::AgentClass>, BuilderError> {
    let lines: Vec<&str> = source.lines().collect();
    let mut classes = HashMap::new();

    let mut i = 0;
    while i < lines.len() {
        if !lines[i].starts_with("# ") {
            i += 1;
            continue;
        }
        let header_line = lines[i];
        let (name, agent_type) = parse_agent_header(header_line)?;
        if classes.contains_key(&name) {
            return Err(BuilderError::DuplicateAgentName(name));
        }
        i += 1;
        let section_start = i;
        while i < lines.len() && !lines[i].starts_with("# ") {
            i += 1;
        }
        let section = &lines[section_start..i];
        let class = build_one_class(&name, agent_type, section)?;
        classes.insert(name, class);
    }

    Ok(classes)
}

fn build_one_class(
    name: &str,
    agent_type: AgentType,
    section: &[&str],
) -> Result<crate::agent::AgentClass, BuilderError> {
    // Description: leading non-empty lines before metadata/H2/fence.
    let mut idx = 0;
    let mut description_lines = Vec::new();
    while idx < section.len() {
        let t = section[idx].trim();
        if t == "metadata:" || t.starts_with("## ") || t.starts_with("```") {
            break;
        }
        if !t.is_empty() {
            description_lines.push(t.to_string());
        }
        idx += 1;
    }
    let description = description_lines.join(" ");

    let mut metadata = HashMap::new();
    if idx < section.len() && section[idx].trim() == "metadata:" {
        idx += 1;
        let start = idx;
        while idx < section.len()
            && !section[idx].starts_with("## ")
            && !section[idx].trim_start().starts_with("```")
            && (section[idx].starts_with(' ') || section[idx].trim().is_empty())
        {
            idx += 1;
        }
        metadata = parse_metadata_block(&section[start..idx]);
    }

    let header = AgentClassHeader {
        id: AgentID::new(name.to_lowercase().replace(' ', "_")),
        klass: name.to_string(),
        description,
        metadata: metadata.clone(),
    };

    // H2 playbook blocks.
    let mut playbooks = HashMap::new();
    let mut cursor = idx;
    while cursor < section.len() {
        if section[cursor].starts_with("## ") {
            let h2_header = section[cursor];
            let body_start = cursor + 1;
            let mut body_end = body_start;
            while body_end < section.len()
                && !section[body_end].starts_with("## ")
                && !(section[body_end].starts_with('#') && !section[body_end].starts_with("##"))
            {
                body_end += 1;
            }
            let raw = parse_h2_block(h2_header, &section[body_start..body_end])?;
            let pb = compile_playbook(raw)?;
            if playbooks.contains_key(&pb.name) {
                return Err(BuilderError::DuplicateAgentName(pb.name));
            }
            playbooks.insert(pb.name.clone(), pb);
            cursor = body_end;
        } else {
            cursor += 1;
        }
    }

    for native in parse_native_playbooks(section) {
        playbooks.entry(native.name.clone()).or_insert(native);
    }

    match agent_type {
        AgentType::Ai => {
            let mut triggers: Vec<TriggerSpec> = playbooks
                .values()
                .flat_map(|p| p.triggers.clone())
                .collect();
            triggers.sort_by_key(|t| t.source_order);
            let start_at_init_playbooks = playbooks
                .values()
                .filter(|p| {
                    p.triggers
                        .iter()
                        .any(|t| matches!(t.kind, crate::triggers::TriggerKind::ProgramStart))
                })
                .map(|p| p.name.clone())
                .collect();
            Ok(crate::agent::AgentClass::Ai(AiAgentClass {
                header,
                playbooks,
                triggers,
                start_at_init_playbooks,
            }))
        }
        AgentType::Human => {
            let channel = match metadata.get("channel").map(String::as_str) {
                Some("streaming") | None => DeliveryChannel::Streaming,
                Some("buffered") => DeliveryChannel::Buffered,
                Some("custom") => DeliveryChannel::Custom,
                Some(other) => {
                    return Err(BuilderError::InvalidMetadata(format!(
                        "unknown channel: {}",
                        other
                    )))
                }
            };
            let meeting_notifications = match metadata.get("meeting_notifications").map(String::as_str) {
                Some("all") | None => MeetingNotifications::All,
                Some("targeted") => MeetingNotifications::Targeted,
                Some("none") => MeetingNotifications::None,
                Some(other) => {
                    return Err(BuilderError::InvalidMetadata(format!(
                        "unknown meeting_notifications: {}",
                        other
                    )))
                }
            };
            let prefs = DeliveryPreferences {
                channel,
                streaming_enabled: channel != DeliveryChannel::Buffered,
                streaming_chunk_size: metadata
                    .get("streaming_chunk_size")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(64),
                buffer_messages: channel == DeliveryChannel::Buffered,
                buffer_timeout_ms: metadata
                    .get("buffer_timeout_ms")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0),
                meeting_notifications,
                custom_handler: None,
            }
            .normalized();
            Ok(crate::agent::AgentClass::Human(HumanAgentClass {
                header,
                name: name.to_string(),
                delivery_preferences: prefs,
            }))
        }
        AgentType::Remote => {
            let transport = RemoteTransport { fields: metadata };
            Ok(crate::agent::AgentClass::Remote(RemoteAgentClass {
                header,
                transport,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentClass;

    const SOURCE: &str = r#"
# Greeter
A friendly greeter agent.

## Main
### Triggers
- at program start
### Steps
- say hello

# Alice:Human
metadata:
  channel: buffered
  meeting_notifications: targeted
"#;

    #[test]
    fn parses_ai_and_human_sections() {
        let classes = build_classes(SOURCE).unwrap();
        assert_eq!(classes.len(), 2);
        match classes.get("Greeter").unwrap() {
            AgentClass::Ai(c) => {
                assert!(c.playbooks.contains_key("Main"));
                assert_eq!(c.start_at_init_playbooks, vec!["Main".to_string()]);
            }
            _ => panic!("expected AI class"),
        }
        match classes.get("Alice").unwrap() {
            AgentClass::Human(c) => {
                assert_eq!(c.delivery_preferences.channel, DeliveryChannel::Buffered);
                assert!(!c.delivery_preferences.streaming_enabled);
                assert_eq!(
                    c.delivery_preferences.meeting_notifications,
                    MeetingNotifications::Targeted
                );
            }
            _ => panic!("expected Human class"),
        }
    }

    #[test]
    fn duplicate_agent_name_fails() {
        let source = "# A\n\n# A\n";
        assert!(matches!(
            build_classes(source),
            Err(BuilderError::DuplicateAgentName(_))
        ));
    }

    #[test]
    fn unknown_agent_type_fails() {
        assert!(matches!(
            parse_agent_header("# A:Alien"),
            Err(BuilderError::UnknownAgentType(_))
        ));
    }

    #[test]
    fn playbook_header_parses_params_with_defaults() {
        let (name, params) = parse_playbook_header("## Greet($name, $loud=false)").unwrap();
        assert_eq!(name, "Greet");
        assert_eq!(params[0].name, "name");
        assert_eq!(params[1].default.as_deref(), Some("false"));
    }
}
