//! Trigger URL annotation.
//!
//! Trigger responses carry their public invocation URL in an
//! annotation. With `public-lb-url` configured the base is static;
//! otherwise it derives from the inbound request. Static wins when both
//! are conceivable.

use serde_json::json;

use kiln_core::models::TRIGGER_ENDPOINT_ANNOTATION;
use kiln_core::Trigger;

/// Scheme + host of the request being answered, when known.
#[derive(Debug, Clone, Copy)]
pub struct RequestBase<'a> {
    pub scheme: &'a str,
    pub host: &'a str,
}

pub trait TriggerAnnotator: Send + Sync {
    /// Stamp the public endpoint annotation onto a trigger.
    fn annotate(&self, trigger: &mut Trigger, request: Option<RequestBase<'_>>);
}

/// Uses a fixed base url (`public-lb-url`).
pub struct StaticUrlAnnotator {
    base: String,
}

impl StaticUrlAnnotator {
    pub fn new(base: &str) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
        }
    }
}

impl TriggerAnnotator for StaticUrlAnnotator {
    fn annotate(&self, trigger: &mut Trigger, _request: Option<RequestBase<'_>>) {
        let url = format!("{}{}", self.base, trigger.source);
        trigger
            .annotations
            .insert(TRIGGER_ENDPOINT_ANNOTATION.to_string(), json!(url));
    }
}

/// Derives the base from the inbound host and scheme.
pub struct RequestBasedAnnotator;

impl TriggerAnnotator for RequestBasedAnnotator {
    fn annotate(&self, trigger: &mut Trigger, request: Option<RequestBase<'_>>) {
        let Some(base) = request else {
            // No request context (e.g. internal lookups): leave the
            // trigger unannotated rather than invent a host.
            return;
        };
        let url = format!("{}://{}{}", base.scheme, base.host, trigger.source);
        trigger
            .annotations
            .insert(TRIGGER_ENDPOINT_ANNOTATION.to_string(), json!(url));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::models::TriggerType;
    use std::collections::BTreeMap;

    fn trigger(source: &str) -> Trigger {
        Trigger {
            id: "t-1".into(),
            app_id: "a-1".into(),
            fn_id: "f-1".into(),
            name: "hook".into(),
            trigger_type: TriggerType::Http,
            source: source.into(),
            annotations: BTreeMap::new(),
            created_at: 1,
            updated_at: 1,
        }
    }

    fn annotated_url(t: &Trigger) -> &str {
        t.annotations[TRIGGER_ENDPOINT_ANNOTATION].as_str().unwrap()
    }

    #[test]
    fn static_base_is_base_plus_source() {
        let annotator = StaticUrlAnnotator::new("https://lb.example/");
        let mut t = trigger("/hook");
        annotator.annotate(&mut t, None);
        assert_eq!(annotated_url(&t), "https://lb.example/hook");
    }

    #[test]
    fn request_base_uses_scheme_and_host() {
        let annotator = RequestBasedAnnotator;
        let mut t = trigger("/hook");
        annotator.annotate(
            &mut t,
            Some(RequestBase {
                scheme: "http",
                host: "node1:8080",
            }),
        );
        assert_eq!(annotated_url(&t), "http://node1:8080/hook");
    }

    #[test]
    fn request_annotator_without_request_leaves_trigger_alone() {
        let annotator = RequestBasedAnnotator;
        let mut t = trigger("/hook");
        annotator.annotate(&mut t, None);
        assert!(t.annotations.is_empty());
    }

    #[test]
    fn annotation_is_stable_across_calls() {
        let annotator = StaticUrlAnnotator::new("https://lb.example");
        let mut t = trigger("/hook");
        annotator.annotate(&mut t, None);
        let first = annotated_url(&t).to_string();
        annotator.annotate(&mut t, None);
        assert_eq!(annotated_url(&t), first);
    }
}
