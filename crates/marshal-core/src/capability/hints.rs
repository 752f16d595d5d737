//! Corrections for capability names callers commonly get wrong.

/// Wrong name → correct invocation shape.
const LEGACY_NAMES: &[(&str, &str)] = &[
    ("websearch", r#"web_search {"query": "<search terms>"}"#),
    ("search", r#"web_search {"query": "<search terms>"}"#),
    ("google", r#"web_search {"query": "<search terms>"}"#),
    ("browse", r#"web_fetch {"url": "<https://...>"}"#),
    ("fetch_url", r#"web_fetch {"url": "<https://...>"}"#),
    ("bash", r#"shell {"command": "<command line>"}"#),
    ("sh", r#"shell {"command": "<command line>"}"#),
    ("exec", r#"shell {"command": "<command line>"}"#),
    ("run", r#"shell {"command": "<command line>"}"#),
    ("terminal", r#"shell {"command": "<command line>"}"#),
    ("run_command", r#"shell {"command": "<command line>"}"#),
    ("execute_command", r#"shell {"command": "<command line>"}"#),
    ("read_file", r#"shell {"command": "cat <path>"}"#),
    ("ps", r#"process {"action": "list"}"#),
    ("processes", r#"process {"action": "list"}"#),
    ("process_list", r#"process {"action": "list"}"#),
    ("poll", r#"process {"action": "poll", "sessionId": "<id>"}"#),
    ("kill", r#"process {"action": "kill", "sessionId": "<id>"}"#),
];

/// Suggested invocation for a known-wrong name. Case-insensitive.
pub fn suggest(name: &str) -> Option<&'static str> {
    let lowered = name.to_ascii_lowercase();
    LEGACY_NAMES
        .iter()
        .find(|(wrong, _)| *wrong == lowered)
        .map(|(_, hint)| *hint)
}

/// Message for an unresolved name.
pub fn unknown_capability_message(name: &str, available: &[String]) -> String {
    let mut message = format!("Unknown capability '{name}'.");
    if let Some(hint) = suggest(name) {
        message.push_str(&format!(" Did you mean: {hint}"));
    }
    if available.is_empty() {
        message.push_str("\nNo capabilities are registered.");
    } else {
        message.push_str(&format!("\nAvailable capabilities: {}", available.join(", ")));
    }
    message
}
