use crate::request::Request;
use crate::router::Routing;
use concord_core::ContextSnapshot;

/// What an inline answer is built from.
pub struct InlineContext<'a> {
    /// Request being answered.
    pub request: &'a Request,
    /// Routing decision that chose the inline path.
    pub routing: &'a Routing,
    /// Request context assembled from the cognitive mesh.
    pub context: &'a ContextSnapshot,
    /// Output of the single inline tool call, if one was made.
    pub tool_output: Option<&'a str>,
}

/// Produces the persona's answer for requests handled inline.
pub trait InlineResponder: Send + Sync {
    /// Answer text for `ctx`.
    fn respond(&self, ctx: &InlineContext<'_>) -> String;
}

/// Plain template answers.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateResponder;

impl InlineResponder for TemplateResponder {
    fn respond(&self, ctx: &InlineContext<'_>) -> String {
        if ctx.routing.analysis.persona_sensitive {
            let mood = ctx
                .context
                .facts
                .get("affect.mood")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("neutral");
            return match mood {
                "distressed" | "low" => {
                    "I'm here with you. Take your time, and tell me what would help most right now."
                        .to_string()
                }
                _ => "I'm here with you. Tell me more about how you're feeling.".to_string(),
            };
        }
        match (ctx.tool_output, ctx.routing.analysis.domains.first()) {
            (Some(output), Some(domain)) => format!("{domain}: {output}"),
            (Some(output), None) => output.to_string(),
            (None, _) => format!("Handled directly: {}", ctx.request.text.trim()),
        }
    }
}
