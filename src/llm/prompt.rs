//! System prompt and request message assembly.

use super::ChatMessage;
use crate::actions::CommandRegistry;
use crate::config::LlmConfig;
use crate::history::RememberedChat;

const SPEECH_GUIDANCE: &str = "The user input may not be spelt or punctuated correctly as it \
may be coming from an automatic speech recognition system. Do not include special characters \
in your answer. This includes the following characters (not including the quotes): '& ^ * # @ -'. \
If you want to use a hyphen, use it like this: 'something something -- something -- something'.";

const COMMAND_GUIDANCE: &str = "You are running on a small robot and you have a set of commands \
you can use to move and make sounds. Use them often, embedded directly in your sentences, in the \
format {{command||parameter}}. For example: \"User: How are you feeling? | Response: \
{{playAnimationWI||sad}} I'm feeling sad...\". Do not use emojis; to express an emotion, use an \
animation command instead. If the command or parameter you want is not in the list, do not use a \
command. Here is every valid command:";

/// Default persona used when no custom prompt is configured.
pub fn default_persona(robot_name: &str) -> String {
    format!(
        "You are a helpful, animated robot called {robot_name}. \
         Keep your answers short and conversational because they will be spoken aloud."
    )
}

/// Build the full system prompt.
///
/// Starts from the configured prompt (or the default persona), appends the
/// speech-recognition guidance and, when commands are enabled, one block per
/// registry entry so the model only emits commands the extractor can resolve.
pub fn build_system_prompt(config: &LlmConfig, registry: &CommandRegistry) -> String {
    let mut prompt = if config.system_prompt.trim().is_empty() {
        default_persona(&config.robot_name)
    } else {
        config.system_prompt.trim().to_owned()
    };

    prompt.push_str("\n\n");
    prompt.push_str(SPEECH_GUIDANCE);

    if config.commands_enable && !registry.is_empty() {
        prompt.push_str("\n\n");
        prompt.push_str(COMMAND_GUIDANCE);
        for cmd in registry.iter() {
            prompt.push_str("\n\nCommand Name: ");
            prompt.push_str(&cmd.command);
            prompt.push_str("\nDescription: ");
            prompt.push_str(&cmd.description);
            prompt.push_str("\nParameter choices: ");
            prompt.push_str(&cmd.param_choices.join(", "));
        }
    }

    prompt
}

/// Messages for a new turn: system prompt, remembered exchanges, then the transcript.
pub fn build_messages(
    system_prompt: &str,
    remembered: Option<&RememberedChat>,
    transcript: &str,
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(2 + remembered.map_or(0, |r| r.messages.len()));
    messages.push(ChatMessage::system(system_prompt));
    if let Some(chat) = remembered {
        messages.extend(chat.messages.iter().cloned());
    }
    messages.push(ChatMessage::user(transcript));
    messages
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::config::RobotConfig;
    use crate::llm::ChatRole;

    fn registry() -> CommandRegistry {
        CommandRegistry::defaults(&RobotConfig::default())
    }

    #[test]
    fn default_prompt_names_robot_and_lists_commands() {
        let prompt = build_system_prompt(&LlmConfig::default(), &registry());
        assert!(prompt.contains("called Vector"));
        assert!(prompt.contains("Command Name: playAnimationWI"));
        assert!(prompt.contains("Parameter choices: drumroll"));
        assert!(prompt.contains("{{command||parameter}}"));
    }

    #[test]
    fn commands_can_be_disabled() {
        let config = LlmConfig {
            commands_enable: false,
            ..LlmConfig::default()
        };
        let prompt = build_system_prompt(&config, &registry());
        assert!(!prompt.contains("Command Name"));
        assert!(prompt.contains("speech recognition"));
    }

    #[test]
    fn custom_prompt_replaces_persona() {
        let config = LlmConfig {
            system_prompt: "You are a pirate.".to_owned(),
            ..LlmConfig::default()
        };
        let prompt = build_system_prompt(&config, &registry());
        assert!(prompt.starts_with("You are a pirate."));
        assert!(!prompt.contains("called Vector"));
    }

    #[test]
    fn messages_order_history_before_transcript() {
        let chat = RememberedChat {
            device_id: "esn".to_owned(),
            messages: vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")],
        };
        let messages = build_messages("sys", Some(&chat), "what time is it");
        let roles: Vec<ChatRole> = messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![ChatRole::System, ChatRole::User, ChatRole::Assistant, ChatRole::User]
        );
        assert_eq!(messages[3].content, "what time is it");
    }
}
