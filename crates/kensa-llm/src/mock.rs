use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use kensa_core::error::ModelError;
use kensa_core::message::Message;
use kensa_core::model::{CallOptions, ChatModel, ChatResult};

type Responder = dyn Fn(&[Message]) -> Result<String, ModelError> + Send + Sync;

/// A ChatModel for tests and dry runs.
///
/// Scripted failures are served first, in order; after that every call is
/// answered by the responder closure.
pub struct ScriptedChatModel {
    name: String,
    failures: Mutex<VecDeque<ModelError>>,
    responder: Box<Responder>,
    call_count: AtomicUsize,
}

impl ScriptedChatModel {
    pub fn new(
        name: impl Into<String>,
        responder: impl Fn(&[Message]) -> Result<String, ModelError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            failures: Mutex::new(VecDeque::new()),
            responder: Box::new(responder),
            call_count: AtomicUsize::new(0),
        }
    }

    /// Always answer with the same text.
    pub fn with_response(response: impl Into<String>) -> Self {
        let response = response.into();
        Self::new("scripted", move |_| Ok(response.clone()))
    }

    /// Echo the last user message back.
    pub fn echo() -> Self {
        Self::new("echo", |messages| {
            Ok(messages
                .iter()
                .rev()
                .find(|m| matches!(m, Message::User { .. }))
                .map(|m| m.content().to_string())
                .unwrap_or_default())
        })
    }

    /// Fail the next calls with these errors before answering normally.
    pub fn failing_first(self, failures: Vec<ModelError>) -> Self {
        if let Ok(mut queue) = self.failures.lock() {
            queue.extend(failures);
        }
        self
    }

    /// Get the number of times this model has been invoked.
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatModel for ScriptedChatModel {
    async fn generate(
        &self,
        messages: &[Message],
        _options: &CallOptions,
    ) -> Result<ChatResult, ModelError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        let scripted = self.failures.lock().ok().and_then(|mut q| q.pop_front());
        if let Some(err) = scripted {
            return Err(err);
        }
        let text = (self.responder)(messages)?;
        Ok(ChatResult { text, usage: None })
    }

    fn model_name(&self) -> &str {
        &self.name
    }
}
