pub mod cache;
pub mod client;
pub mod protocol;

pub use cache::TranslationCache;
pub use client::TranslationStock;
pub use protocol::TranslationCommand;

use crate::resource::ResourceAddress;
use http::StatusCode;
use std::time::Duration;

/// What we tell the translation server about the request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranslateRequest {
    pub uri: String,
    pub host: Option<String>,
    /// session cookie value, if any
    pub session: Option<String>,
    pub realm: Option<String>,
    pub check: Option<Vec<u8>>,
    pub auth: Option<Vec<u8>>,
    pub want_full_uri: Option<String>,
    /// widget class lookup instead of URI routing
    pub widget_type: Option<String>,
    pub param: Option<String>,
}

impl TranslateRequest {
    /// The value of one request feature, as used for cache keys and
    /// invalidation matching.
    pub fn feature(&self, command: TranslationCommand) -> Option<String> {
        match command {
            TranslationCommand::Uri => Some(self.uri.clone()),
            TranslationCommand::Host => self.host.clone(),
            TranslationCommand::Session => self.session.clone(),
            TranslationCommand::Realm => self.realm.clone(),
            TranslationCommand::Check => {
                self.check.as_ref().map(|c| format!("{:02x?}", c))
            }
            TranslationCommand::Auth => self.auth.as_ref().map(|c| format!("{:02x?}", c)),
            TranslationCommand::WantFullUri => self.want_full_uri.clone(),
            TranslationCommand::WidgetType => self.widget_type.clone(),
            TranslationCommand::Param => self.param.clone(),
            _ => None,
        }
    }
}

/// Per-header-group forwarding policy of a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeaderForwardMode {
    #[default]
    No,
    Yes,
    /// forward, but rewrite/launder (e.g. Host, X-Forwarded-For)
    Mangle,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeaderForwardSettings {
    pub identity: HeaderForwardMode,
    pub capabilities: HeaderForwardMode,
    pub cookie: HeaderForwardMode,
    pub other: HeaderForwardMode,
}

/// One way of rendering a widget class: an address plus header policy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct View {
    /// `None` is the default view
    pub name: Option<String>,
    pub address: ResourceAddress,
    pub request_header_forward: HeaderForwardSettings,
    pub response_header_forward: HeaderForwardSettings,
}

/// The translation server's verdict for one request.
#[derive(Debug, Clone, Default)]
pub struct TranslateResponse {
    /// fixed response status (e.g. a bare redirect), bypassing dispatch
    pub status: Option<StatusCode>,
    pub address: ResourceAddress,
    pub redirect: Option<String>,
    pub test_path: Option<String>,

    // caching / matching
    pub base: Option<String>,
    pub easy_base: bool,
    pub regex: Option<String>,
    pub inverse_regex: Option<String>,
    pub unsafe_base: bool,
    pub expand_path: Option<String>,
    pub max_age: Option<Duration>,
    /// request features that are part of this response's cache identity
    pub vary: Vec<TranslationCommand>,
    /// drop cached peers matching these request features
    pub invalidate: Vec<TranslationCommand>,
    pub cache_tag: Option<String>,
    pub auto_flush_cache: bool,

    // content processing
    pub process: bool,
    pub container: bool,
    pub process_css: bool,
    pub process_text: bool,
    pub prefix_css_class: bool,
    pub prefix_xml_id: bool,
    pub focus_widget: bool,
    pub stateful: bool,

    /// views of a widget class (first one is the default)
    pub views: Vec<View>,
}

impl TranslateResponse {
    pub fn view(&self, name: Option<&str>) -> Option<&View> {
        match name {
            None => self.views.first(),
            Some(name) => self
                .views
                .iter()
                .find(|v| v.name.as_deref() == Some(name)),
        }
    }
}
