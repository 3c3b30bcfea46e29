//! Interactive input exchange.
//!
//! A prompt is written into the shared tree; whoever answers first (this
//! replica through [`InputExchange::respond`], or a collaborator) resolves
//! the [`PendingInput`] future. Disposing the exchange cancels the future.
//!
//! ```text
//!   {path}/prompt    "Password:"
//!   {path}/password  true
//!   {path}/reply     "hunter2"   ← first write resolves PendingInput
//! ```

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use serde_json::json;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::document::Disposable;
use crate::error::CollabError;
use crate::path::Path;
use crate::primitives::{ReplicatedValue, ValueChange};
use crate::view::DocumentView;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum InputError {
    #[error("input request was cancelled")]
    Cancelled,
    #[error(transparent)]
    Document(#[from] CollabError),
}

struct ExchangeInner {
    reply: ReplicatedValue<String>,
    sender: RefCell<Option<oneshot::Sender<String>>>,
}

impl ExchangeInner {
    fn resolve(&self, change: &ValueChange<String>) {
        let Some(reply) = &change.new_value else {
            return;
        };
        if let Some(sender) = self.sender.borrow_mut().take() {
            log::debug!("input request at {} answered", self.reply.path());
            // A dropped receiver means nobody is waiting any more.
            let _ = sender.send(reply.clone());
        }
    }
}

impl Disposable for ExchangeInner {
    fn dispose(&self) {
        if self.sender.borrow_mut().take().is_some() {
            log::debug!("input request at {} cancelled", self.reply.path());
        }
        self.reply.release();
    }

    fn is_disposed(&self) -> bool {
        self.reply.is_disposed()
    }
}

/// Owning side of one input request.
pub struct InputExchange {
    inner: Rc<ExchangeInner>,
}

/// Resolves to the first reply, or [`InputError::Cancelled`].
pub struct PendingInput {
    receiver: oneshot::Receiver<String>,
}

impl Future for PendingInput {
    type Output = Result<String, InputError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.map_err(|_| InputError::Cancelled))
    }
}

impl InputExchange {
    /// Publish a prompt at `path` (relative to `view`) and wait for the reply.
    pub fn open(
        view: &DocumentView,
        path: impl Into<Path>,
        prompt: &str,
        password: bool,
    ) -> Result<(InputExchange, PendingInput), InputError> {
        let path = view.resolve(path);
        let doc = view.document()?;
        let (target, prompt) = (path.clone(), json!(prompt));
        doc.apply_local_change(move |m| {
            m.remove(&target.child("reply"))?;
            m.set(&target.child("prompt"), &prompt)?;
            m.set(&target.child("password"), &json!(password))
        })?;

        let reply = view.create_value::<String>(path.child("reply"))?;
        let (sender, receiver) = oneshot::channel();
        let inner = Rc::new(ExchangeInner {
            reply,
            sender: RefCell::new(Some(sender)),
        });
        let weak = Rc::downgrade(&inner);
        inner.reply.changed().connect(move |change| {
            if let Some(inner) = weak.upgrade() {
                inner.resolve(change);
            }
        });
        view.adopt(inner.clone());
        log::debug!("input requested at {path}");
        Ok((InputExchange { inner }, PendingInput { receiver }))
    }

    /// Answer the prompt from this replica.
    pub fn respond(&self, value: impl Into<String>) -> Result<(), InputError> {
        self.inner.reply.set(value.into())?;
        Ok(())
    }

    pub fn is_pending(&self) -> bool {
        self.inner.sender.borrow().is_some()
    }

    /// Cancel the request; the pending future resolves to `Cancelled`.
    pub fn dispose(&self) {
        self.inner.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{DocumentConfig, ReplicatedDocument};

    #[tokio::test]
    async fn test_local_reply_resolves() {
        let doc = ReplicatedDocument::new(DocumentConfig::default());
        let view = doc.view(["nb", "cells", "c1"]);
        let (exchange, pending) = InputExchange::open(&view, "stdin", "Name:", false).unwrap();
        assert!(exchange.is_pending());
        exchange.respond("Ada").unwrap();
        assert!(!exchange.is_pending());
        assert_eq!(pending.await, Ok("Ada".to_string()));
    }

    #[tokio::test]
    async fn test_remote_reply_resolves() {
        let doc = ReplicatedDocument::new(DocumentConfig::default());
        let view = doc.view("kernel");
        let (_exchange, pending) = InputExchange::open(&view, "stdin", "Password:", true).unwrap();

        let peer = ReplicatedDocument::new(DocumentConfig::default());
        for cs in doc.take_outbound() {
            peer.merge_change_set(&cs).unwrap();
        }
        let prompt = peer.read(|r| {
            use crate::document::TreeRead;
            r.get(&Path::from(["kernel", "stdin", "prompt"]))
        });
        assert_eq!(prompt.unwrap().unwrap(), Some(json!("Password:")));

        let reply = peer.view(["kernel", "stdin"]).create_value::<String>("reply").unwrap();
        reply.set("hunter2".into()).unwrap();
        for cs in peer.take_outbound() {
            doc.merge_change_set(&cs).unwrap();
        }
        assert_eq!(pending.await, Ok("hunter2".to_string()));
    }

    #[tokio::test]
    async fn test_dispose_cancels() {
        let doc = ReplicatedDocument::new(DocumentConfig::default());
        let view = doc.view("kernel");
        let (exchange, pending) = InputExchange::open(&view, "stdin", "?", false).unwrap();
        exchange.dispose();
        assert_eq!(pending.await, Err(InputError::Cancelled));
    }

    #[tokio::test]
    async fn test_view_dispose_cancels() {
        let doc = ReplicatedDocument::new(DocumentConfig::default());
        let view = doc.view("kernel");
        let (_exchange, pending) = InputExchange::open(&view, "stdin", "?", false).unwrap();
        doc.dispose();
        assert_eq!(pending.await, Err(InputError::Cancelled));
    }
}
