//! Robot actions and the command grammar embedded in model output.
//!
//! The model is told about every [`CommandDefinition`] in the
//! [`CommandRegistry`] and may embed `{{command||parameter}}` spans in its
//! prose. The [`extractor`] turns text into an ordered list of [`Action`]s
//! using the same registry, and the [`player`] executes them on the robot.

pub mod extractor;
pub mod player;

use crate::config::RobotConfig;
use crate::error::{KgError, Result};
use std::collections::HashSet;

/// What a command does when it is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    /// Speak the parameter.
    SayText,
    /// Play the animation named by the parameter.
    PlayAnimation {
        /// Whether the animation interrupts speech. Non-interrupting
        /// animations run alongside the speech timeline.
        interrupting: bool,
    },
    /// Play the sound named by the parameter.
    PlaySound,
}

/// One unit of robot output. Immutable once extracted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    SayText(String),
    PlayAnimation { name: String, interrupting: bool },
    PlaySound(String),
}

impl Action {
    /// Build the action a resolved command produces for `parameter`.
    pub fn from_kind(kind: ActionKind, parameter: impl Into<String>) -> Self {
        match kind {
            ActionKind::SayText => Self::SayText(parameter.into()),
            ActionKind::PlayAnimation { interrupting } => Self::PlayAnimation {
                name: parameter.into(),
                interrupting,
            },
            ActionKind::PlaySound => Self::PlaySound(parameter.into()),
        }
    }

    pub fn is_speech(&self) -> bool {
        matches!(self, Self::SayText(_))
    }
}

/// Registry entry for a command the model may use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandDefinition {
    /// Name used inside `{{...}}`. Matched exactly and case-sensitively.
    pub command: String,
    /// Description shown to the model.
    pub description: String,
    /// Parameter values shown to the model.
    pub param_choices: Vec<String>,
    pub kind: ActionKind,
}

/// Set of commands with unique names, in advertisement order.
#[derive(Debug, Clone, Default)]
pub struct CommandRegistry {
    commands: Vec<CommandDefinition>,
}

impl CommandRegistry {
    /// Build a registry from definitions.
    ///
    /// # Errors
    ///
    /// Returns [`KgError::Config`] if two definitions share a command name.
    pub fn new(commands: Vec<CommandDefinition>) -> Result<Self> {
        let mut seen = HashSet::new();
        for def in &commands {
            if !seen.insert(def.command.as_str()) {
                return Err(KgError::Config(format!(
                    "duplicate command definition '{}'",
                    def.command
                )));
            }
        }
        Ok(Self { commands })
    }

    /// The standard animation and sound commands, with parameter choices
    /// taken from the configured asset maps.
    pub fn defaults(robot: &RobotConfig) -> Self {
        let animations: Vec<String> = robot.animations.keys().cloned().collect();
        let sounds: Vec<String> = robot.sounds.keys().cloned().collect();
        Self {
            commands: vec![
                CommandDefinition {
                    command: "playAnimation".to_owned(),
                    description: "Plays an animation on the robot. This will interrupt speech."
                        .to_owned(),
                    param_choices: animations.clone(),
                    kind: ActionKind::PlayAnimation { interrupting: true },
                },
                CommandDefinition {
                    command: "playAnimationWI".to_owned(),
                    description: "Plays an animation on the robot without interrupting speech."
                        .to_owned(),
                    param_choices: animations,
                    kind: ActionKind::PlayAnimation {
                        interrupting: false,
                    },
                },
                CommandDefinition {
                    command: "playSound".to_owned(),
                    description: "Plays a sound on the robot.".to_owned(),
                    param_choices: sounds,
                    kind: ActionKind::PlaySound,
                },
            ],
        }
    }

    pub fn get(&self, command: &str) -> Option<&CommandDefinition> {
        self.commands.iter().find(|c| c.command == command)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommandDefinition> {
        self.commands.iter()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    fn def(command: &str) -> CommandDefinition {
        CommandDefinition {
            command: command.to_owned(),
            description: String::new(),
            param_choices: Vec::new(),
            kind: ActionKind::PlaySound,
        }
    }

    #[test]
    fn duplicate_commands_are_rejected() {
        let err = CommandRegistry::new(vec![def("a"), def("b"), def("a")]).unwrap_err();
        assert!(err.to_string().contains("duplicate command definition 'a'"));
    }

    #[test]
    fn defaults_are_unique_and_advertise_assets() {
        let registry = CommandRegistry::defaults(&RobotConfig::default());
        let names: Vec<&str> = registry.iter().map(|c| c.command.as_str()).collect();
        assert_eq!(names, vec!["playAnimation", "playAnimationWI", "playSound"]);
        assert!(CommandRegistry::new(registry.iter().cloned().collect()).is_ok());

        let wi = registry.get("playAnimationWI").unwrap();
        assert_eq!(wi.kind, ActionKind::PlayAnimation { interrupting: false });
        assert!(wi.param_choices.iter().any(|p| p == "celebrate"));
        assert_eq!(registry.get("playSound").unwrap().param_choices, vec!["drumroll"]);
    }

    #[test]
    fn lookup_is_case_sensitive() {
        let registry = CommandRegistry::defaults(&RobotConfig::default());
        assert!(registry.get("playanimation").is_none());
    }

    #[test]
    fn action_from_kind() {
        assert_eq!(
            Action::from_kind(ActionKind::PlayAnimation { interrupting: true }, "happy"),
            Action::PlayAnimation {
                name: "happy".to_owned(),
                interrupting: true
            }
        );
        assert!(Action::from_kind(ActionKind::SayText, "hi").is_speech());
    }
}
