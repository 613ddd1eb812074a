//! Leads (read-only input owned by the import pipeline) and campaign target filters.

use serde::{Deserialize, Serialize};

use outreach_core::LeadId;

/// One email address attached to a lead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadEmail {
    pub address: String,
    pub is_primary: bool,
    pub is_validated: bool,
}

/// A business contact produced by the import/enrichment pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub id: LeadId,
    pub company_name: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub industry: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub company_size: Option<String>,
    pub status: Option<String>,
    pub source: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub quality_score: Option<i32>,
    #[serde(default)]
    pub emails: Vec<LeadEmail>,
}

impl Lead {
    /// Address a campaign should send to.
    ///
    /// Preference order: primary and validated, primary, validated, first listed.
    pub fn preferred_email(&self) -> Option<&LeadEmail> {
        let usable = || self.emails.iter().filter(|e| !e.address.trim().is_empty());

        usable()
            .find(|e| e.is_primary && e.is_validated)
            .or_else(|| usable().find(|e| e.is_primary))
            .or_else(|| usable().find(|e| e.is_validated))
            .or_else(|| usable().next())
    }
}

/// Predicate over lead attributes selecting a campaign's audience.
///
/// Every populated field must match; an empty filter matches every lead that
/// has a usable email. `tags` matches when the lead carries any of them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeadFilter {
    pub industry: Option<String>,
    pub status: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub company_size: Option<String>,
    pub source: Option<String>,
    pub tags: Vec<String>,
    pub min_quality_score: Option<i32>,
    pub require_validated_email: bool,
}

impl LeadFilter {
    pub fn matches(&self, lead: &Lead) -> bool {
        let Some(email) = lead.preferred_email() else {
            return false;
        };
        if self.require_validated_email && !email.is_validated {
            return false;
        }

        let fields = [
            (&self.industry, &lead.industry),
            (&self.status, &lead.status),
            (&self.city, &lead.city),
            (&self.state, &lead.state),
            (&self.country, &lead.country),
            (&self.company_size, &lead.company_size),
            (&self.source, &lead.source),
        ];
        if !fields
            .iter()
            .all(|(wanted, actual)| wanted.is_none() || *wanted == *actual)
        {
            return false;
        }

        if !self.tags.is_empty() && !self.tags.iter().any(|t| lead.tags.contains(t)) {
            return false;
        }

        match self.min_quality_score {
            Some(min) => lead.quality_score.is_some_and(|score| score >= min),
            None => true,
        }
    }
}
