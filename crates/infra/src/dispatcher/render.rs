//! Message rendering for the dispatcher.

use std::sync::Arc;

use async_trait::async_trait;

use outreach_campaigns::{CampaignSnapshot, Recipient, RecipientVariables, RenderedMessage};
use outreach_core::{CampaignId, TemplateId};

use crate::repository::{RepositoryError, TemplateStore};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    #[error("campaign {0} has no template")]
    NoTemplate(CampaignId),
    #[error("template not found: {0}")]
    TemplateNotFound(TemplateId),
    #[error("template is inactive: {0}")]
    TemplateInactive(TemplateId),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[async_trait]
pub trait MessageRenderer: Send + Sync {
    async fn render(
        &self,
        campaign: &CampaignSnapshot,
        recipient: &Recipient,
    ) -> Result<RenderedMessage, RenderError>;
}

/// Renders the campaign's stored template and, when a tracking base URL is
/// configured, appends the open-tracking pixel.
pub struct TemplateRenderer {
    templates: Arc<dyn TemplateStore>,
    tracking_base_url: Option<String>,
}

impl TemplateRenderer {
    pub fn new(templates: Arc<dyn TemplateStore>, tracking_base_url: Option<String>) -> Self {
        Self {
            templates,
            tracking_base_url: tracking_base_url.map(|u| u.trim_end_matches('/').to_string()),
        }
    }

    fn pixel(&self, recipient: &Recipient) -> Option<String> {
        self.tracking_base_url.as_ref().map(|base| {
            format!(
                r#"<img src="{base}/track/{}" width="1" height="1" alt="" style="display:none" />"#,
                recipient.tracking_id
            )
        })
    }
}

#[async_trait]
impl MessageRenderer for TemplateRenderer {
    async fn render(
        &self,
        campaign: &CampaignSnapshot,
        recipient: &Recipient,
    ) -> Result<RenderedMessage, RenderError> {
        let template_id = campaign.template_id.ok_or(RenderError::NoTemplate(campaign.id))?;
        let template = self
            .templates
            .get_template(template_id)
            .await?
            .ok_or(RenderError::TemplateNotFound(template_id))?;
        if !template.is_active {
            return Err(RenderError::TemplateInactive(template_id));
        }

        let vars = RecipientVariables::from_recipient(recipient);
        let mut message = template.render(campaign.subject.as_deref(), &vars);
        if let Some(pixel) = self.pixel(recipient) {
            message.html_body.push_str(&pixel);
        }
        Ok(message)
    }
}
