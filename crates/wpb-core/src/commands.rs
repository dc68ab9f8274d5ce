//! Prefixed text commands (`.ping`, `.autoreact on`, ...).

use crate::registry::BotConfig;

pub const DEFAULT_PREFIX: char = '.';

#[derive(Clone, Debug)]
pub struct CommandDispatcher {
    prefix: char,
}

impl Default for CommandDispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

fn on_off(v: bool) -> &'static str {
    if v {
        "ON"
    } else {
        "OFF"
    }
}

fn parse_switch(arg: Option<&str>) -> Option<bool> {
    match arg.map(|a| a.to_lowercase()).as_deref() {
        Some("on") => Some(true),
        Some("off") => Some(false),
        _ => None,
    }
}

impl CommandDispatcher {
    pub fn new(prefix: char) -> Self {
        Self { prefix }
    }

    pub fn is_command(&self, text: &str) -> bool {
        text.starts_with(self.prefix)
    }

    /// Split `".cmd arg1 arg2"` into a lowercased command word and its args.
    fn parse<'a>(&self, text: &'a str) -> Option<(String, Vec<&'a str>)> {
        let rest = text.strip_prefix(self.prefix)?;
        let mut parts = rest.split_whitespace();
        let cmd = parts.next().unwrap_or("").to_lowercase();
        Some((cmd, parts.collect()))
    }

    /// Run a command against `config`. Returns the reply to send, if any.
    ///
    /// Non-prefixed text and unknown commands yield `None`.
    pub fn dispatch(&self, text: &str, config: &mut BotConfig) -> Option<String> {
        let (cmd, args) = self.parse(text)?;
        let arg = args.first().copied();
        let p = self.prefix;

        let reply = match cmd.as_str() {
            "ping" => "pong ✅".to_string(),

            "help" | "menu" => format!(
                "Available commands:\n\
{p}ping\n\
{p}autoview on|off\n\
{p}autoreact on|off\n\
{p}reactemoji 😄\n\
{p}antidelete on|off"
            ),

            "autoview" => match parse_switch(arg) {
                Some(v) => {
                    config.auto_view = v;
                    format!("Auto View Status: {}", on_off(v))
                }
                None => format!(
                    "Auto View Status is {}.\nUse: {p}autoview on|off",
                    on_off(config.auto_view)
                ),
            },

            "autoreact" => match parse_switch(arg) {
                Some(v) => {
                    config.auto_react = v;
                    format!("Auto React: {}", on_off(v))
                }
                None => format!(
                    "Auto React is {}.\nUse: {p}autoreact on|off",
                    on_off(config.auto_react)
                ),
            },

            "reactemoji" => match arg {
                Some(emoji) => {
                    config.react_emoji = emoji.to_string();
                    format!("Reaction emoji set to {emoji}")
                }
                None => format!(
                    "Current reaction emoji: {}\nUse: {p}reactemoji 😄",
                    config.react_emoji
                ),
            },

            "antidelete" => match parse_switch(arg) {
                Some(v) => {
                    config.anti_delete = v;
                    format!("Anti Delete: {}", on_off(v))
                }
                None => format!(
                    "Anti Delete is {}.\nUse: {p}antidelete on|off",
                    on_off(config.anti_delete)
                ),
            },

            _ => return None,
        };

        Some(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn autoreact_toggle_and_query() {
        let d = CommandDispatcher::default();
        let mut cfg = BotConfig::default();

        assert_eq!(
            d.dispatch(".autoreact on", &mut cfg).as_deref(),
            Some("Auto React: ON")
        );
        assert!(cfg.auto_react);

        let before = cfg.clone();
        let reply = d.dispatch(".autoreact", &mut cfg).unwrap();
        assert!(reply.contains("ON"));
        assert!(reply.contains("Use: .autoreact on|off"));
        assert_eq!(cfg, before);

        d.dispatch(".autoreact off", &mut cfg);
        assert!(!cfg.auto_react);
    }

    #[test]
    fn invalid_argument_reports_state_without_mutating() {
        let d = CommandDispatcher::default();
        let mut cfg = BotConfig::default();
        let reply = d.dispatch(".antidelete maybe", &mut cfg).unwrap();
        assert_eq!(reply, "Anti Delete is ON.\nUse: .antidelete on|off");
        assert!(cfg.anti_delete);
    }

    #[test]
    fn command_word_and_switch_are_case_insensitive() {
        let d = CommandDispatcher::default();
        let mut cfg = BotConfig::default();
        assert_eq!(
            d.dispatch(".AutoView ON", &mut cfg).as_deref(),
            Some("Auto View Status: ON")
        );
        assert!(cfg.auto_view);
    }

    #[test]
    fn ping_help_and_menu() {
        let d = CommandDispatcher::default();
        let mut cfg = BotConfig::default();
        assert_eq!(d.dispatch(".ping", &mut cfg).as_deref(), Some("pong ✅"));
        let help = d.dispatch(".help", &mut cfg).unwrap();
        assert!(help.starts_with("Available commands:"));
        assert!(help.contains(".antidelete on|off"));
        assert_eq!(d.dispatch(".menu", &mut cfg), Some(help));
    }

    #[test]
    fn reactemoji_sets_and_reports() {
        let d = CommandDispatcher::default();
        let mut cfg = BotConfig::default();
        let reply = d.dispatch(".reactemoji", &mut cfg).unwrap();
        assert!(reply.starts_with("Current reaction emoji: ❤️"));

        d.dispatch(".reactemoji 🔥", &mut cfg);
        assert_eq!(cfg.react_emoji, "🔥");
    }

    #[test]
    fn unknown_and_plain_text_are_ignored() {
        let d = CommandDispatcher::default();
        let mut cfg = BotConfig::default();
        assert!(d.dispatch(".selfdestruct", &mut cfg).is_none());
        assert!(d.dispatch("ping", &mut cfg).is_none());
        assert!(d.dispatch(".", &mut cfg).is_none());
    }

    #[test]
    fn custom_prefix() {
        let d = CommandDispatcher::new('!');
        let mut cfg = BotConfig::default();
        assert!(d.dispatch(".ping", &mut cfg).is_none());
        assert_eq!(d.dispatch("!ping", &mut cfg).as_deref(), Some("pong ✅"));
        assert!(d.dispatch("!help", &mut cfg).unwrap().contains("!autoview"));
    }
}
