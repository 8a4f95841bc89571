//! Fakes shared by the broker and callback tests.

use crate::popup::{PopupFeatures, PopupOpener, PopupWindow};
use async_trait::async_trait;
use secrecy::ExposeSecret as _;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};
use stowage_types::{
    ExchangeRequest, ExchangeResponse, StowageError, TokenExchange, traits::Result,
};

/// What the fake backend answers.
pub enum Reply {
    Token(&'static str),
    Empty,
    Fail(&'static str),
}

/// Records `(code, redirect_uri, client_id, client_secret)` of every call.
pub struct RecordingExchange {
    reply: Reply,
    pub calls: Mutex<Vec<(String, String, String, String)>>,
}

impl RecordingExchange {
    pub fn new(reply: Reply) -> Arc<Self> {
        Arc::new(Self {
            reply,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl TokenExchange for RecordingExchange {
    async fn exchange(&self, request: &ExchangeRequest) -> Result<ExchangeResponse> {
        self.calls.lock().unwrap().push((
            request.code.clone(),
            request.redirect_uri.clone(),
            request.client_id.clone(),
            request.client_secret.expose_secret().to_string(),
        ));
        match self.reply {
            Reply::Token(t) => Ok(ExchangeResponse {
                access_token: Some(t.to_string()),
            }),
            Reply::Empty => Ok(ExchangeResponse::default()),
            Reply::Fail(msg) => Err(StowageError::Http(msg.to_string())),
        }
    }
}

#[derive(Default)]
pub struct FakePopup {
    closed: AtomicBool,
    pub close_calls: AtomicUsize,
}

impl FakePopup {
    /// Simulate the user closing the window.
    pub fn user_close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl PopupWindow for FakePopup {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeOpener {
    pub blocked: bool,
    pub opened: Mutex<Vec<String>>,
    pub last: Mutex<Option<Arc<FakePopup>>>,
}

impl FakeOpener {
    pub fn blocking() -> Arc<Self> {
        Arc::new(Self {
            blocked: true,
            ..Self::default()
        })
    }

    pub fn popup(&self) -> Arc<FakePopup> {
        self.last.lock().unwrap().clone().unwrap()
    }

    pub fn opened_url(&self) -> String {
        self.opened.lock().unwrap().last().cloned().unwrap()
    }
}

impl PopupOpener for FakeOpener {
    fn open(&self, url: &str, _features: PopupFeatures) -> Option<Arc<dyn PopupWindow>> {
        if self.blocked {
            return None;
        }
        self.opened.lock().unwrap().push(url.to_string());
        let popup = Arc::new(FakePopup::default());
        *self.last.lock().unwrap() = Some(Arc::clone(&popup));
        Some(popup)
    }
}

/// Query parameter `name` of `url`.
pub fn query_param(url: &str, name: &str) -> String {
    let query = url.split_once('?').map_or("", |(_, q)| q);
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(query).unwrap();
    pairs
        .into_iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v)
        .unwrap()
}
