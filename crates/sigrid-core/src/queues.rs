// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::VecDeque;
use std::sync::Mutex;

use sigrid_config::SteeringMode;

/// The three user-message queues of the turn engine.
///
/// Shared between the controller (producers) and the engine (consumer), so
/// steering can arrive while a run holds the engine lock.
///
/// - **steering**: delivered inline into the running turn.
/// - **follow-up**: delivered after the current turn ends, before idle.
/// - **next-turn context**: auxiliary content attached to the next user
///   prompt, consumed once and cleared.
#[derive(Debug, Default)]
pub struct MessageQueues {
    steering: Mutex<VecDeque<String>>,
    follow_up: Mutex<VecDeque<String>>,
    next_turn_context: Mutex<Vec<(String, String)>>,
}

impl MessageQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_steering(&self, text: impl Into<String>) {
        self.steering.lock().unwrap().push_back(text.into());
    }

    pub fn push_follow_up(&self, text: impl Into<String>) {
        self.follow_up.lock().unwrap().push_back(text.into());
    }

    /// Queue `(custom_type, content)` for the next prompt.
    pub fn push_next_turn_context(&self, custom_type: impl Into<String>, content: impl Into<String>) {
        self.next_turn_context
            .lock()
            .unwrap()
            .push((custom_type.into(), content.into()));
    }

    pub fn has_steering(&self) -> bool {
        !self.steering.lock().unwrap().is_empty()
    }

    /// Drain steering according to policy.  `OneAtATime` delivers a single
    /// message and moves the rest to the follow-up queue.
    pub fn take_steering(&self, mode: SteeringMode) -> Vec<String> {
        let mut steering = self.steering.lock().unwrap();
        match mode {
            SteeringMode::All => steering.drain(..).collect(),
            SteeringMode::OneAtATime => {
                let Some(first) = steering.pop_front() else {
                    return Vec::new();
                };
                let mut follow_up = self.follow_up.lock().unwrap();
                follow_up.extend(steering.drain(..));
                vec![first]
            }
        }
    }

    /// Drain follow-ups according to policy.  `OneAtATime` delivers one and
    /// leaves the rest queued for the next boundary.
    pub fn take_follow_up(&self, mode: SteeringMode) -> Vec<String> {
        let mut follow_up = self.follow_up.lock().unwrap();
        match mode {
            SteeringMode::All => follow_up.drain(..).collect(),
            SteeringMode::OneAtATime => follow_up.pop_front().into_iter().collect(),
        }
    }

    /// Consume the next-turn context, clearing it.
    pub fn take_next_turn_context(&self) -> Vec<(String, String)> {
        std::mem::take(&mut *self.next_turn_context.lock().unwrap())
    }

    /// Messages currently queued behind the running turn (for tools that
    /// want to yield early when the user has moved on).
    pub fn queued_count(&self) -> usize {
        self.steering.lock().unwrap().len() + self.follow_up.lock().unwrap().len()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steering_all_drains_everything() {
        let q = MessageQueues::new();
        q.push_steering("a");
        q.push_steering("b");
        assert!(q.has_steering());
        assert_eq!(q.take_steering(SteeringMode::All), vec!["a", "b"]);
        assert!(!q.has_steering());
    }

    #[test]
    fn steering_one_at_a_time_moves_rest_to_follow_up() {
        let q = MessageQueues::new();
        q.push_steering("a");
        q.push_steering("b");
        q.push_steering("c");
        assert_eq!(q.take_steering(SteeringMode::OneAtATime), vec!["a"]);
        assert!(!q.has_steering());
        assert_eq!(q.take_follow_up(SteeringMode::All), vec!["b", "c"]);
    }

    #[test]
    fn follow_up_one_at_a_time_leaves_remainder_queued() {
        let q = MessageQueues::new();
        q.push_follow_up("x");
        q.push_follow_up("y");
        assert_eq!(q.take_follow_up(SteeringMode::OneAtATime), vec!["x"]);
        assert_eq!(q.take_follow_up(SteeringMode::OneAtATime), vec!["y"]);
        assert!(q.take_follow_up(SteeringMode::OneAtATime).is_empty());
    }

    #[test]
    fn next_turn_context_is_consumed_once() {
        let q = MessageQueues::new();
        q.push_next_turn_context("file_mention", "content");
        assert_eq!(q.take_next_turn_context().len(), 1);
        assert!(q.take_next_turn_context().is_empty());
    }

    #[test]
    fn queued_count_spans_both_queues() {
        let q = MessageQueues::new();
        q.push_steering("a");
        q.push_follow_up("b");
        assert_eq!(q.queued_count(), 2);
    }

    #[test]
    fn take_steering_on_empty_queue_is_empty() {
        let q = MessageQueues::new();
        assert!(q.take_steering(SteeringMode::OneAtATime).is_empty());
        assert!(q.take_steering(SteeringMode::All).is_empty());
    }
}
