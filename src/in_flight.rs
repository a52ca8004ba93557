//! Acknowledgment tracking for produced records.
//!
//! Every processed incoming message becomes one [`InFlightMessageGroup`]
//! holding a slot per record the user logic sent while handling it. Groups are
//! queued per input topic in consumption order in a [`CommitQueue`]. The
//! offset of an incoming message may only be committed once its group and
//! every group before it are fully acknowledged.

use std::collections::VecDeque;

use crate::{
    error::{Error, Result},
    types::{Offset, Partition, Topic},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckState {
    Pending,
    Acknowledged,
    /// The broker reported the record as not written. Never becomes
    /// acknowledged.
    Failed,
}

/// One submitted record.
#[derive(Clone, Debug, PartialEq)]
pub struct InFlightMessage {
    pub topic: Topic,
    pub partition: Partition,
    state: AckState,
}

impl InFlightMessage {
    pub fn new(topic: Topic, partition: Partition) -> Self {
        Self {
            topic,
            partition,
            state: AckState::Pending,
        }
    }

    pub fn state(&self) -> AckState {
        self.state
    }

    pub fn is_acknowledged(&self) -> bool {
        self.state == AckState::Acknowledged
    }
}

/// Everything produced while handling one incoming message.
#[derive(Clone, Debug, PartialEq)]
pub struct InFlightMessageGroup {
    sequence: u64,
    offset: Offset,
    messages: Vec<InFlightMessage>,
}

impl InFlightMessageGroup {
    pub fn new(sequence: u64, offset: Offset, messages: Vec<InFlightMessage>) -> Self {
        Self {
            sequence,
            offset,
            messages,
        }
    }

    /// Per-partition number of the group, as carried by each record's
    /// correlation.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Offset of the incoming message.
    pub fn offset(&self) -> Offset {
        self.offset
    }

    pub fn messages(&self) -> &[InFlightMessage] {
        &self.messages
    }

    /// A group that sent nothing is acknowledged from the start.
    pub fn is_acknowledged(&self) -> bool {
        self.messages.iter().all(InFlightMessage::is_acknowledged)
    }

    pub fn has_failures(&self) -> bool {
        self.messages
            .iter()
            .any(|message| message.state == AckState::Failed)
    }
}

/// In-flight groups of one input topic, oldest first.
#[derive(Clone, Debug)]
pub struct CommitQueue {
    topic: Topic,
    groups: VecDeque<InFlightMessageGroup>,
}

impl CommitQueue {
    pub fn new(topic: impl Into<Topic>) -> Self {
        Self {
            topic: topic.into(),
            groups: VecDeque::new(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn groups(&self) -> impl Iterator<Item = &InFlightMessageGroup> {
        self.groups.iter()
    }

    /// Append the group of the most recently processed message.
    pub fn push(&mut self, group: InFlightMessageGroup) -> Result<()> {
        if let Some(tail) = self.groups.back() {
            if group.offset <= tail.offset || group.sequence <= tail.sequence {
                return Err(Error::OutOfOrderGroup {
                    topic: self.topic.clone(),
                    offset: group.offset,
                    tail: tail.offset,
                });
            }
        }
        self.groups.push_back(group);
        Ok(())
    }

    /// Drop acknowledged groups that are followed by another acknowledged
    /// group.
    ///
    /// The last group of an acknowledged run stays behind so the run is still
    /// represented by its highest offset when offsets are next committed.
    /// Returns the number of groups removed.
    pub fn compact(&mut self) -> usize {
        let mut removed = 0;
        while self.groups.len() > 1
            && self.groups[0].is_acknowledged()
            && self.groups[1].is_acknowledged()
        {
            self.groups.pop_front();
            removed += 1;
        }
        removed
    }

    /// Remove the acknowledged prefix of the queue and return the offset of
    /// its last group, which is the highest offset safe to commit.
    pub fn drain_acknowledged(&mut self) -> Option<Offset> {
        let mut offset = None;
        while let Some(head) = self.groups.front() {
            if !head.is_acknowledged() {
                break;
            }
            offset = Some(head.offset);
            self.groups.pop_front();
        }
        offset
    }

    pub fn acknowledge(&mut self, sequence: u64, slot: usize) -> Result<()> {
        self.transition(sequence, slot, AckState::Acknowledged)
    }

    pub fn fail(&mut self, sequence: u64, slot: usize) -> Result<()> {
        self.transition(sequence, slot, AckState::Failed)
    }

    fn transition(&mut self, sequence: u64, slot: usize, state: AckState) -> Result<()> {
        let index = self
            .groups
            .binary_search_by_key(&sequence, InFlightMessageGroup::sequence)
            .map_err(|_| Error::UnknownGroup {
                topic: self.topic.clone(),
                sequence,
            })?;
        let message = self.groups[index]
            .messages
            .get_mut(slot)
            .ok_or_else(|| Error::UnknownSubmission {
                topic: self.topic.clone(),
                sequence,
                slot,
            })?;
        if message.state != AckState::Pending {
            return Err(Error::DuplicateCompletion {
                topic: self.topic.clone(),
                sequence,
                slot,
            });
        }
        message.state = state;
        Ok(())
    }
}
