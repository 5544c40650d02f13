//! Built-in creative pipeline
//!
//! `brief -> assets -> compliance -> review -> publish`, where `review` is a
//! human approval gate that sends rejected creative back to `brief`.

use crate::agent::{AgentClient, AgentKind, AgentRequest};
use adflow_kernel::prelude::*;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Definition id of the built-in pipeline
pub const CREATIVE_CAMPAIGN: &str = "creative-campaign";

pub mod steps {
    pub const BRIEF: &str = "brief";
    pub const ASSETS: &str = "assets";
    pub const COMPLIANCE: &str = "compliance";
    pub const REVIEW: &str = "review";
    pub const PUBLISH: &str = "publish";
}

fn request(ctx: &StepContext, agent: AgentKind, prompt: String, context: Value) -> AgentRequest {
    AgentRequest {
        agent,
        run_id: ctx.run_id,
        prompt,
        context,
    }
}

/// Writes the campaign brief. On a rework visit the reviewer's note is
/// folded into the prompt.
pub struct BriefUnit {
    client: Arc<dyn AgentClient>,
}

#[async_trait]
impl StepUnit for BriefUnit {
    async fn invoke(&self, ctx: &StepContext) -> Result<Value, StepError> {
        let field = |name: &str| ctx.input.get(name).and_then(Value::as_str).unwrap_or("unspecified");
        let mut prompt = format!(
            "Write an advertising brief for {} by {}, aimed at {}.",
            field("product"),
            field("brand"),
            field("audience"),
        );
        let feedback = ctx
            .result(steps::REVIEW)
            .and_then(|review| review.get("note"))
            .and_then(Value::as_str);
        if let Some(note) = feedback {
            prompt.push_str(&format!(" Address reviewer feedback: {note}"));
        }
        let context = json!({ "input": ctx.input, "previous": ctx.result(steps::BRIEF) });
        Ok(self
            .client
            .call(request(ctx, AgentKind::Brief, prompt, context))
            .await?)
    }
}

/// Generates image, video and audio for the brief concurrently.
pub struct AssetsUnit {
    client: Arc<dyn AgentClient>,
}

#[async_trait]
impl StepUnit for AssetsUnit {
    async fn invoke(&self, ctx: &StepContext) -> Result<Value, StepError> {
        let brief = ctx
            .result(steps::BRIEF)
            .cloned()
            .ok_or_else(|| StepError::permanent("assets need a brief"))?;
        let headline = brief
            .get("headline")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let ask = |agent: AgentKind| {
            self.client.call(request(
                ctx,
                agent,
                format!("Produce {agent} creative for: {headline}"),
                json!({ "brief": brief }),
            ))
        };
        let (image, video, audio) = futures::try_join!(
            ask(AgentKind::Image),
            ask(AgentKind::Video),
            ask(AgentKind::Audio)
        )?;
        Ok(json!({ "image": image, "video": video, "audio": audio }))
    }
}

/// Brand and compliance check. A failed check is final for this visit:
/// retrying the same creative cannot fix it.
pub struct ComplianceUnit {
    client: Arc<dyn AgentClient>,
}

#[async_trait]
impl StepUnit for ComplianceUnit {
    async fn invoke(&self, ctx: &StepContext) -> Result<Value, StepError> {
        let context = json!({
            "brief": ctx.result(steps::BRIEF),
            "assets": ctx.result(steps::ASSETS),
        });
        let report = self
            .client
            .call(request(
                ctx,
                AgentKind::Compliance,
                "Check the creative against brand and advertising rules".into(),
                context,
            ))
            .await?;
        match report.get("passed").and_then(Value::as_bool) {
            Some(true) => Ok(report),
            Some(false) => Err(StepError::permanent(format!(
                "compliance check failed: {}",
                report.get("findings").cloned().unwrap_or(Value::Null)
            ))),
            None => Err(StepError::invalid_output("compliance report has no verdict")),
        }
    }
}

pub struct PublishUnit {
    client: Arc<dyn AgentClient>,
}

#[async_trait]
impl StepUnit for PublishUnit {
    async fn invoke(&self, ctx: &StepContext) -> Result<Value, StepError> {
        let context = json!({
            "brief": ctx.result(steps::BRIEF),
            "assets": ctx.result(steps::ASSETS),
            "approval": ctx.result(steps::REVIEW),
        });
        Ok(self
            .client
            .call(request(
                ctx,
                AgentKind::Publish,
                "Publish the approved creative".into(),
                context,
            ))
            .await?)
    }
}

fn brief_schema() -> Value {
    json!({
        "type": "object",
        "required": ["headline", "body"],
        "properties": {
            "headline": { "type": "string", "minLength": 1 },
            "body": { "type": "string" }
        }
    })
}

fn assets_schema() -> Value {
    let asset = json!({
        "type": "object",
        "required": ["url"],
        "properties": { "url": { "type": "string" } }
    });
    json!({
        "type": "object",
        "required": ["image", "video", "audio"],
        "properties": { "image": asset, "video": asset, "audio": asset }
    })
}

/// The `creative-campaign` step graph over `client`.
pub fn creative_campaign(client: Arc<dyn AgentClient>) -> Result<StepRegistry, ValidationError> {
    let brief = Arc::new(BriefUnit {
        client: Arc::clone(&client),
    });
    let assets = Arc::new(AssetsUnit {
        client: Arc::clone(&client),
    });
    let compliance = Arc::new(ComplianceUnit {
        client: Arc::clone(&client),
    });
    let publish = Arc::new(PublishUnit { client });

    StepRegistry::new(CREATIVE_CAMPAIGN)
        .with_step(
            StepDefinition::task(steps::BRIEF, brief)
                .named("Brief generation")
                .with_output_schema(brief_schema())
                .then(steps::ASSETS),
        )?
        .with_step(
            StepDefinition::task(steps::ASSETS, assets)
                .named("Asset generation")
                .with_timeout(Duration::from_secs(300))
                .with_output_schema(assets_schema())
                .then(steps::COMPLIANCE),
        )?
        .with_step(
            StepDefinition::task(steps::COMPLIANCE, compliance)
                .named("Compliance check")
                .then(steps::REVIEW),
        )?
        .with_step(
            StepDefinition::approval(steps::REVIEW)
                .named("Human review")
                .on_approve(steps::PUBLISH)
                .on_reject(steps::BRIEF),
        )?
        .with_step(
            StepDefinition::task(steps::PUBLISH, publish)
                .named("Publish")
                .finish(),
        )
}

/// Register the built-in definitions with `engine`.
pub fn install_builtin(
    engine: &WorkflowEngine,
    client: Arc<dyn AgentClient>,
) -> Result<Arc<StepRegistry>, EngineError> {
    engine.register_definition(creative_campaign(client)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::SimulatedAgentClient;

    #[test]
    fn pipeline_validates_in_declared_order() {
        let registry = creative_campaign(Arc::new(SimulatedAgentClient::new())).unwrap();
        registry.validate().unwrap();
        let ids: Vec<&str> = registry.steps().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["brief", "assets", "compliance", "review", "publish"]);
        assert_eq!(registry.entry().map(StepId::as_str), Some("brief"));
        assert!(registry.is_interrupt_point(steps::REVIEW));
        assert!(!registry.is_interrupt_point(steps::ASSETS));
    }

    #[test]
    fn schemas_accept_simulated_payloads() {
        let registry = creative_campaign(Arc::new(SimulatedAgentClient::new())).unwrap();
        let brief = json!({ "headline": "Run further", "body": "..." });
        assert!(registry.check_output(steps::BRIEF, &brief).is_ok());
        assert!(registry.check_output(steps::BRIEF, &json!({ "headline": "" })).is_err());

        let asset = json!({ "url": "sim://x" });
        let assets = json!({ "image": asset, "video": asset, "audio": asset });
        assert!(registry.check_output(steps::ASSETS, &assets).is_ok());
    }
}
