//! The turn-taking loop: alternate generation requests between two personas,
//! feeding each side's output to the other as input.
//!
//! A conversation moves `Idle -> Running -> (Completed | Failed | Cancelled)`.
//! Idle is simply "not started yet"; [`start`] spawns the running loop and
//! hands back a [`ConversationHandle`] for events and cancellation, keeping
//! the loop independent of whatever front end drives it.

use std::fmt;
use std::time::Duration;

use strum::{Display, EnumString};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::endpoint::{ChatBackend, ChatMessage};
use crate::transcript::{TranscriptWriter, Turn};

/// A named conversational role bound to one backend.
#[derive(Debug, Clone)]
pub struct Persona<B> {
    pub name: String,
    pub backend: B,
}

/// Read-only for the duration of a run.
#[derive(Debug, Clone)]
pub struct ConversationSettings {
    pub topic: String,
    pub max_turns: usize,
    /// Pause between consecutive turns.
    pub turn_delay: Duration,
    /// Most recent turns included as context in each request; minimum 1,
    /// so the other side's last utterance is always relayed.
    pub history_window: usize,
    pub first_speaker: Speaker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Speaker {
    First,
    Second,
}

impl Speaker {
    pub fn other(self) -> Self {
        match self {
            Speaker::First => Speaker::Second,
            Speaker::Second => Speaker::First,
        }
    }

    fn index(self) -> usize {
        match self {
            Speaker::First => 0,
            Speaker::Second => 1,
        }
    }
}

/// Terminal state of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    /// A generation call exhausted its retries; carries the human-readable
    /// reason.
    Failed(String),
    Cancelled,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Completed => write!(f, "completed"),
            Outcome::Failed(reason) => write!(f, "failed: {reason}"),
            Outcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ConversationEvent {
    TurnCompleted(Turn),
    Finished(Outcome),
}

/// Handle to a running conversation: one event per completed turn, a
/// terminal event, and cooperative cancellation.
pub struct ConversationHandle {
    events: mpsc::UnboundedReceiver<ConversationEvent>,
    cancel: watch::Sender<bool>,
    task: JoinHandle<Outcome>,
}

impl ConversationHandle {
    pub async fn next_event(&mut self) -> Option<ConversationEvent> {
        self.events.recv().await
    }

    /// Request a stop. The in-flight call, if any, finishes or times out;
    /// no further turns are attempted.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// A detached cancellation trigger, e.g. for a signal handler.
    pub fn canceller(&self) -> Canceller {
        Canceller(self.cancel.clone())
    }

    /// Wait for the loop to finish and return its terminal state.
    pub async fn join(self) -> Outcome {
        self.task
            .await
            .unwrap_or_else(|_| Outcome::Failed("conversation task panicked".to_owned()))
    }
}

#[derive(Clone)]
pub struct Canceller(watch::Sender<bool>);

impl Canceller {
    pub fn cancel(&self) {
        let _ = self.0.send(true);
    }
}

/// Spawn the conversation loop. The writer is owned by the loop for the whole
/// run and finalized on every terminal state.
pub fn start<B>(
    settings: ConversationSettings,
    personas: [Persona<B>; 2],
    writer: TranscriptWriter,
) -> ConversationHandle
where
    B: ChatBackend + Send + Sync + 'static,
{
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let task = tokio::spawn(run(settings, personas, writer, event_tx, cancel_rx));
    ConversationHandle {
        events: event_rx,
        cancel: cancel_tx,
        task,
    }
}

async fn run<B: ChatBackend>(
    settings: ConversationSettings,
    personas: [Persona<B>; 2],
    mut writer: TranscriptWriter,
    events: mpsc::UnboundedSender<ConversationEvent>,
    mut cancel: watch::Receiver<bool>,
) -> Outcome {
    tracing::info!(
        topic = %settings.topic,
        max_turns = settings.max_turns,
        "conversation starting"
    );

    let mut speaker = settings.first_speaker;
    let mut outcome = Outcome::Completed;

    for index in 0..settings.max_turns {
        if *cancel.borrow() {
            outcome = Outcome::Cancelled;
            break;
        }

        let persona = &personas[speaker.index()];
        let other = &personas[speaker.other().index()];
        // `remaining` counts the reply being generated now.
        let remaining = settings.max_turns - index;
        let context = build_context(
            &persona.name,
            &other.name,
            &settings.topic,
            writer.turns(),
            settings.history_window,
            remaining,
        );

        match persona.backend.generate(&context).await {
            Ok(raw) => {
                let turn = Turn {
                    index,
                    speaker: persona.name.clone(),
                    model: persona.backend.model().to_owned(),
                    text: clean_reply(&raw),
                };
                writer.append(&turn);
                let _ = events.send(ConversationEvent::TurnCompleted(turn));
                speaker = speaker.other();
            }
            Err(error) => {
                tracing::error!(speaker = %persona.name, %error, "turn failed");
                outcome = Outcome::Failed(error.to_string());
                break;
            }
        }

        if index + 1 < settings.max_turns && !settings.turn_delay.is_zero() {
            // The delay is the one place a stop request can interrupt; the
            // loop head re-checks the flag either way.
            tokio::select! {
                _ = tokio::time::sleep(settings.turn_delay) => {}
                _ = cancel.changed() => {}
            }
        }
    }

    writer.finalize(&outcome);
    tracing::info!(%outcome, turns = writer.turns().len(), "conversation finished");
    let _ = events.send(ConversationEvent::Finished(outcome.clone()));
    outcome
}

/// Chat context for the active persona: its system prompt, then the most
/// recent `window` turns mapped to roles from its perspective, the other
/// side's utterances relayed as `From {name}: ...`. The final user message
/// carries a wrap-up cue when the conversation is about to end.
fn build_context(
    active: &str,
    other: &str,
    topic: &str,
    turns: &[Turn],
    window: usize,
    remaining: usize,
) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(persona_prompt(active, other))];

    if turns.is_empty() {
        messages.push(ChatMessage::user(format!(
            "From {other}: Start a friendly, curious conversation about: {topic}"
        )));
    } else {
        let window = window.max(1);
        let start = turns.len().saturating_sub(window);
        for turn in &turns[start..] {
            if turn.speaker == active {
                messages.push(ChatMessage::assistant(turn.text.clone()));
            } else {
                messages.push(ChatMessage::user(format!(
                    "From {}: {}",
                    turn.speaker, turn.text
                )));
            }
        }
    }

    // Strict alternation means the trailing message is always the other
    // side's, hence a user message.
    if let Some(cue) = wrap_cue(remaining) {
        if let Some(last) = messages.last_mut() {
            last.content.push_str(cue);
        }
    }
    messages
}

fn persona_prompt(name: &str, other: &str) -> String {
    format!(
        "You are {name}. You're chatting with {other}. Speak naturally and conversationally. \
         Do NOT mention model names, training, providers, parameters, or that you are an \
         AI/model/assistant. Avoid phrases like 'as a language model'. Reply clearly in <= 150 \
         words and end with a single direct question if it helps the conversation flow."
    )
}

fn wrap_cue(remaining: usize) -> Option<&'static str> {
    match remaining {
        2 => Some(
            "\n\n[Wrap-up cue: there are two messages left in total. Briefly summarise your \
             view in 1-2 sentences and ask one short final question.]",
        ),
        1 => Some(
            "\n\n[Final-turn cue: this is the last message. Offer a quick thank-you and a \
             clear goodbye. Do not ask another question.]",
        ),
        _ => None,
    }
}

/// Strip the "thoughtful question:" label some models prepend, plus
/// surrounding whitespace.
fn clean_reply(raw: &str) -> String {
    let mut text = raw.trim();
    if let Some(rest) = strip_prefix_ignore_case(text, "thoughtful") {
        if let Some(rest) = strip_prefix_ignore_case(rest.trim_start(), "question") {
            if let Some(rest) = rest.trim_start().strip_prefix(':') {
                text = rest.trim_start();
            }
        }
    }
    text.to_owned()
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &text[prefix.len()..])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(index: usize, speaker: &str, text: &str) -> Turn {
        Turn {
            index,
            speaker: speaker.to_owned(),
            model: "m".to_owned(),
            text: text.to_owned(),
        }
    }

    #[test]
    fn the_first_context_seeds_from_the_topic() {
        let context = build_context("Bob", "Jane", "tea or coffee", &[], 10, 4);
        assert_eq!(context.len(), 2);
        assert_eq!(
            context[1].content,
            "From Jane: Start a friendly, curious conversation about: tea or coffee"
        );
    }

    #[test]
    fn the_window_keeps_only_the_most_recent_turns() {
        let turns = vec![
            turn(0, "Bob", "zero"),
            turn(1, "Jane", "one"),
            turn(2, "Bob", "two"),
            turn(3, "Jane", "three"),
        ];
        let context = build_context("Bob", "Jane", "t", &turns, 2, 10);

        // System prompt plus exactly the last two turns.
        assert_eq!(context.len(), 3);
        assert_eq!(context[1].content, "two");
        assert_eq!(context[2].content, "From Jane: three");
    }

    #[test]
    fn a_zero_window_still_relays_the_last_utterance() {
        let turns = vec![turn(0, "Bob", "zero"), turn(1, "Jane", "one")];
        let context = build_context("Bob", "Jane", "t", &turns, 0, 10);
        assert_eq!(context.len(), 2);
        assert_eq!(context[1].content, "From Jane: one");
    }

    #[test]
    fn wrap_cues_land_on_the_last_two_turns_only() {
        let turns = vec![turn(0, "Bob", "zero")];
        let plain = build_context("Jane", "Bob", "t", &turns, 10, 3);
        assert!(!plain[1].content.contains("cue"));

        let summarise = build_context("Jane", "Bob", "t", &turns, 10, 2);
        assert!(summarise[1].content.contains("[Wrap-up cue:"));

        let goodbye = build_context("Jane", "Bob", "t", &turns, 10, 1);
        assert!(goodbye[1].content.contains("[Final-turn cue:"));
    }

    #[test]
    fn cleans_the_thoughtful_question_label() {
        assert_eq!(
            clean_reply("  Thoughtful Question:  what now?"),
            "what now?"
        );
        assert_eq!(clean_reply("THOUGHTFUL QUESTION: hm"), "hm");
        assert_eq!(clean_reply("thoughtfulquestion: hm"), "hm");
        assert_eq!(clean_reply("A thoughtful question: hm"), "A thoughtful question: hm");
        assert_eq!(clean_reply("  plain reply  "), "plain reply");
    }

    #[test]
    fn speakers_parse_from_cli_names() {
        assert_eq!("first".parse::<Speaker>().unwrap(), Speaker::First);
        assert_eq!("second".parse::<Speaker>().unwrap(), Speaker::Second);
        assert_eq!(Speaker::First.other(), Speaker::Second);
    }
}
