use super::Widget;
use crate::error::ProxyError;
use crate::translation::{TranslateRequest, TranslationCache};
use tracing::debug;

/// Resolve a widget's class by asking the translation server for its
/// type name. Responses are memoised by the translation cache, so most
/// lookups never leave the process.
pub async fn resolve_widget_class(
    translation: &TranslationCache,
    widget: &mut Widget,
) -> Result<(), ProxyError> {
    if widget.class.is_some() {
        return Ok(());
    }
    let Some(class_name) = widget.class_name.clone() else {
        return Err(ProxyError::Translation(
            "widget without a type cannot be resolved".into(),
        ));
    };

    let request = TranslateRequest {
        widget_type: Some(class_name.clone()),
        ..Default::default()
    };
    let response = translation.translate(&request).await?;
    if response.views.is_empty() && !response.address.is_defined() {
        debug!("resolver: class '{}' has no address", class_name);
        return Err(ProxyError::Translation(format!(
            "widget class '{}' is undefined",
            class_name
        )));
    }
    widget.class = Some(response);
    Ok(())
}
