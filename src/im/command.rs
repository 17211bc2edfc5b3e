use std::collections::BTreeMap;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("not a command: {0:?}")]
    NotACommand(String),
}

/// A leading `/token` and the words that followed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub args: Vec<String>,
}

impl Command {
    /// Partition the arguments into `key=value` pairs and positional words.
    ///
    /// Only the first `=` separates key from value, so `url=a=b` yields
    /// `("url", "a=b")`. Later duplicates of a key win.
    pub fn split_args(&self) -> (BTreeMap<String, String>, Vec<String>) {
        let mut keyword = BTreeMap::new();
        let mut positional = Vec::new();
        for arg in &self.args {
            match arg.split_once('=') {
                Some((key, value)) => {
                    keyword.insert(key.to_string(), value.to_string());
                }
                None => positional.push(arg.clone()),
            }
        }
        (keyword, positional)
    }
}

/// Strategy a flow uses to turn command text into a [`Command`].
pub type CommandParser = fn(&str) -> Result<Command, CommandError>;

/// Default parser: split on single spaces, first token is the command.
pub fn parse_command(text: &str) -> Result<Command, CommandError> {
    if !text.starts_with('/') {
        return Err(CommandError::NotACommand(text.to_string()));
    }
    let mut parts = text.split(' ');
    let name = parts.next().unwrap_or_default().to_string();
    Ok(Command {
        name,
        args: parts.map(str::to_string).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_command() {
        let cmd = parse_command("/send").unwrap();
        assert_eq!(cmd.name, "/send");
        assert!(cmd.args.is_empty());
    }

    #[test]
    fn test_parse_with_args() {
        let cmd = parse_command("/new langs=en,es draft").unwrap();
        assert_eq!(cmd.name, "/new");
        assert_eq!(cmd.args, vec!["langs=en,es", "draft"]);
    }

    #[test]
    fn test_parse_rejects_non_commands() {
        assert_eq!(
            parse_command("hello"),
            Err(CommandError::NotACommand("hello".to_string()))
        );
        assert_eq!(
            parse_command(""),
            Err(CommandError::NotACommand(String::new()))
        );
    }

    #[test]
    fn test_parse_splits_on_single_spaces() {
        let cmd = parse_command("/new  en").unwrap();
        assert_eq!(cmd.args, vec!["", "en"]);
    }

    #[test]
    fn test_split_args() {
        let cmd = parse_command("/new langs=en,es pt server=https://a.b/?x=1").unwrap();
        let (keyword, positional) = cmd.split_args();
        assert_eq!(keyword.get("langs").map(String::as_str), Some("en,es"));
        assert_eq!(
            keyword.get("server").map(String::as_str),
            Some("https://a.b/?x=1")
        );
        assert_eq!(positional, vec!["pt"]);
    }

    #[test]
    fn test_split_args_empty() {
        let (keyword, positional) = parse_command("/cancel").unwrap().split_args();
        assert!(keyword.is_empty());
        assert!(positional.is_empty());
    }
}
