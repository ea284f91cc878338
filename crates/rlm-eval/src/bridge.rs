//! Correlated queries from running fragments to the parent.
//!
//! A query is written as an `llm_query` record carrying a fresh token, and
//! the caller then blocks on the inbound side until an `llm_result` with the
//! same token shows up. Several queries can be outstanding at once: whichever
//! waiter is currently reading parks answers that belong to other tokens, so
//! the parent may answer in any order.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use uuid::Uuid;

use crate::channel::Channel;
use crate::error::Error;
use crate::protocol::{Inbound, Outbound};

/// Default number of hex digits in a query token.
pub const DEFAULT_TOKEN_LEN: usize = 12;

/// Accepted range for configurable token lengths.
pub const TOKEN_LEN_RANGE: std::ops::RangeInclusive<usize> = 8..=32;

type TokenSource = Box<dyn FnMut() -> String>;

/// Issues queries over a [`Channel`] and matches answers back to them.
pub struct QueryBridge {
    channel: Rc<Channel>,
    tokens: RefCell<TokenSource>,
    outstanding: RefCell<HashSet<String>>,
    parked: RefCell<HashMap<String, String>>,
}

impl QueryBridge {
    pub fn new(channel: Rc<Channel>) -> Self {
        Self::with_token_len(channel, DEFAULT_TOKEN_LEN)
    }

    /// Random tokens of `len` hex digits, clamped to [`TOKEN_LEN_RANGE`].
    pub fn with_token_len(channel: Rc<Channel>, len: usize) -> Self {
        let len = len.clamp(*TOKEN_LEN_RANGE.start(), *TOKEN_LEN_RANGE.end());
        Self::with_tokens(channel, move || {
            let mut token = Uuid::new_v4().simple().to_string();
            token.truncate(len);
            token
        })
    }

    /// Use a caller-supplied token generator. Tokens must be unique among
    /// outstanding queries.
    pub fn with_tokens(channel: Rc<Channel>, tokens: impl FnMut() -> String + 'static) -> Self {
        Self {
            channel,
            tokens: RefCell::new(Box::new(tokens)),
            outstanding: RefCell::new(HashSet::new()),
            parked: RefCell::new(HashMap::new()),
        }
    }

    /// Ask the parent and block until it answers.
    pub fn query(&self, sub_context: &str, instruction: &str) -> crate::Result<String> {
        let id = self.issue(sub_context, instruction)?;
        let answer = self.wait(&id);
        if answer.is_err() {
            self.forget(&id);
        }
        answer
    }

    /// Send a query without waiting for it. Returns its token.
    pub fn issue(&self, sub_context: &str, instruction: &str) -> crate::Result<String> {
        let id = (*self.tokens.borrow_mut())();
        if !self.outstanding.borrow_mut().insert(id.clone()) {
            return Err(Error::Runtime(format!("query token {id} is already in use")));
        }

        let sent = self.channel.send(&Outbound::LlmQuery {
            sub_context: sub_context.to_string(),
            instruction: instruction.to_string(),
            id: id.clone(),
        });
        if let Err(err) = sent {
            self.outstanding.borrow_mut().remove(&id);
            return Err(err);
        }
        tracing::debug!(%id, "issued query");
        Ok(id)
    }

    /// Block until the answer for `id` is available and take it.
    ///
    /// Answers for other outstanding queries read along the way are kept for
    /// their own waiters. Anything else on the inbound side is dropped.
    pub fn wait(&self, id: &str) -> crate::Result<String> {
        if let Some(answer) = self.take_parked(id) {
            return Ok(answer);
        }
        if !self.outstanding.borrow().contains(id) {
            return Err(Error::Runtime(format!(
                "query {id} is unknown or was already collected"
            )));
        }

        loop {
            let Some(record) = self.channel.recv()? else {
                return Err(Error::ChannelClosed { id: id.to_string() });
            };

            match record {
                Inbound::LlmResult { id: answered, result } => {
                    let answer = result.unwrap_or_default();
                    if answered == id {
                        self.outstanding.borrow_mut().remove(id);
                        tracing::debug!(%id, "query answered");
                        return Ok(answer);
                    }
                    if self.outstanding.borrow().contains(&answered) {
                        tracing::debug!(id = %answered, waiting_for = %id, "parking early answer");
                        self.parked.borrow_mut().insert(answered, answer);
                    } else {
                        tracing::trace!(id = %answered, "dropping answer for unknown query");
                    }
                }
                other => {
                    tracing::trace!(
                        kind = other.kind(),
                        waiting_for = %id,
                        "dropping record while awaiting query"
                    );
                }
            }
        }
    }

    /// Hand over an answer read outside of [`QueryBridge::wait`].
    ///
    /// The answer is kept for a later `wait` if `id` is outstanding and
    /// dropped otherwise. Returns whether it was kept.
    pub fn deliver(&self, id: String, result: Option<String>) -> bool {
        if !self.outstanding.borrow().contains(&id) {
            tracing::trace!(%id, "dropping answer for unknown query");
            return false;
        }
        tracing::debug!(%id, "parking answer between runs");
        self.parked.borrow_mut().insert(id, result.unwrap_or_default());
        true
    }

    /// Stop tracking `id`. A parked answer for it is discarded, and an
    /// answer arriving later is dropped as unknown.
    pub fn forget(&self, id: &str) {
        let was_outstanding = self.outstanding.borrow_mut().remove(id);
        let was_parked = self.parked.borrow_mut().remove(id).is_some();
        if was_outstanding || was_parked {
            tracing::debug!(%id, answered = was_parked, "forgot uncollected query");
        }
    }

    /// Number of queries issued but not yet collected.
    pub fn outstanding(&self) -> usize {
        self.outstanding.borrow().len()
    }

    fn take_parked(&self, id: &str) -> Option<String> {
        let answer = self.parked.borrow_mut().remove(id)?;
        self.outstanding.borrow_mut().remove(id);
        Some(answer)
    }
}
