//! Subcommands and the registry the binary dispatches through.

pub mod dump;
pub mod record;
pub mod report;

use crate::error::{Error, Result};
use clap::Parser;
use std::collections::BTreeMap;

pub trait Command {
    fn name(&self) -> &'static str;

    fn short_help(&self) -> &'static str;

    /// Run with the arguments following the command name.
    fn run(&mut self, args: &[String]) -> Result<()>;
}

pub type CommandFactory = fn() -> Box<dyn Command>;

struct Registration {
    short_help: &'static str,
    factory: CommandFactory,
}

/// Command name to constructor. Nothing is registered implicitly; the
/// binary builds it with [`CommandRegistry::with_builtin_commands`].
#[derive(Default)]
pub struct CommandRegistry {
    commands: BTreeMap<&'static str, Registration>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin_commands() -> Self {
        let mut registry = Self::new();
        for factory in [
            record::RecordCommand::create as CommandFactory,
            report::ReportCommand::create,
            dump::DumpCommand::create,
        ] {
            registry.register(factory);
        }
        registry
    }

    /// Register a command under the name it reports, replacing any earlier
    /// command of that name.
    pub fn register(&mut self, factory: CommandFactory) {
        let command = factory();
        self.commands.insert(
            command.name(),
            Registration {
                short_help: command.short_help(),
                factory,
            },
        );
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.commands.remove(name).is_some()
    }

    pub fn create(&self, name: &str) -> Option<Box<dyn Command>> {
        self.commands.get(name).map(|r| (r.factory)())
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.commands.keys().copied()
    }

    /// One line per command, for the top-level help.
    pub fn help_text(&self) -> String {
        let mut text = String::from("Commands:\n");
        for (name, r) in &self.commands {
            text.push_str(&format!("  {:<10}{}\n", name, r.short_help));
        }
        text
    }
}

/// Parse command arguments. Returns `None` when clap printed help or the
/// version instead.
pub(crate) fn parse_args<T: Parser>(name: &str, args: &[String]) -> Result<Option<T>> {
    let argv = std::iter::once(name.to_string()).chain(args.iter().cloned());
    match T::try_parse_from(argv) {
        Ok(parsed) => Ok(Some(parsed)),
        Err(e)
            if matches!(
                e.kind(),
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
            ) =>
        {
            e.print()?;
            Ok(None)
        }
        Err(e) => Err(Error::InvalidArgument(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl Command for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }
        fn short_help(&self) -> &'static str {
            "print arguments"
        }
        fn run(&mut self, args: &[String]) -> Result<()> {
            if args.is_empty() {
                Err(Error::InvalidArgument("nothing to echo".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn create_echo() -> Box<dyn Command> {
        Box::new(Echo)
    }

    #[test]
    fn test_builtin_commands() {
        let registry = CommandRegistry::with_builtin_commands();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["dump", "record", "report"]);
        assert_eq!(registry.create("report").unwrap().name(), "report");
        assert!(registry.create("stat").is_none());
        assert!(registry.help_text().contains("record"));
    }

    #[test]
    fn test_register_and_unregister() {
        let mut registry = CommandRegistry::new();
        registry.register(create_echo);
        let mut echo = registry.create("echo").unwrap();
        assert!(echo.run(&["hi".to_string()]).is_ok());
        assert!(echo.run(&[]).is_err());
        assert!(registry.unregister("echo"));
        assert!(!registry.unregister("echo"));
        assert!(registry.create("echo").is_none());
    }

    #[derive(Parser, Debug)]
    struct Args {
        #[arg(short)]
        n: u32,
    }

    #[test]
    fn test_parse_args() {
        let parsed: Option<Args> = parse_args("x", &["-n".to_string(), "3".to_string()]).unwrap();
        assert_eq!(parsed.unwrap().n, 3);
        assert!(parse_args::<Args>("x", &["-q".to_string()]).is_err());
    }
}
