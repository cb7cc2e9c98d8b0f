//! # Origination
//!
//! Placing a call on behalf of a person: find the phone of the internal type on file for them,
//! then have the PBX ring it and connect it to the number being called. How the PBX is asked is
//! up to `PbxClient` and its `OriginationSettings`.
use std::sync::Arc;

use tracing::debug;

use cdr_common::call::OriginateStatus;

use crate::client::PbxClient;
use crate::directory::{PersonDirectory, PersonRef};
use crate::error::SyncError;
use crate::numbers::NumberRule;

/// A text with `{name}` placeholders. Unknown placeholders are left as they are, and the
/// rendered text is trimmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template(String);

impl Template {
    pub fn new(source: &str) -> Self {
        Self(source.to_owned())
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }

    pub fn render(&self, fields: &[(&str, &str)]) -> String {
        let mut rendered = String::with_capacity(self.0.len());
        let mut rest = self.0.as_str();

        while let Some(open) = rest.find('{') {
            rendered.push_str(&rest[..open]);
            let after = &rest[open + 1..];

            let field = after.find('}').and_then(|close| {
                let name = after[..close].trim();
                fields
                    .iter()
                    .find(|(field, _)| *field == name)
                    .map(|(_, value)| (close, *value))
            });
            match field {
                Some((close, value)) => {
                    rendered.push_str(value);
                    rest = &after[close + 1..];
                }
                None => {
                    rendered.push('{');
                    rest = after;
                }
            }
        }
        rendered.push_str(rest);

        rendered.trim().to_owned()
    }
}

/// How calls are originated. Templates see `{caller_id}`, `{from}` and `{to}`, the numbers
/// after `number_rule` was applied.
#[derive(Debug, Clone)]
pub struct OriginationSettings {
    pub number_rule: NumberRule,
    pub caller_id_template: Template,
    /// When set, calls are placed with a GET to this URL instead of the PBX `originate` command.
    pub url_template: Option<Template>,
}

impl OriginationSettings {
    pub fn new(number_rule: NumberRule, caller_id_template: &str, url_template: &str) -> Self {
        let url_template = Template::new(url_template);
        Self {
            number_rule,
            caller_id_template: Template::new(caller_id_template),
            url_template: (!url_template.is_blank()).then_some(url_template),
        }
    }
}

impl Default for OriginationSettings {
    fn default() -> Self {
        Self::new(NumberRule::Identity, "{caller_id}", "")
    }
}

pub struct PersonOriginator {
    client: Arc<PbxClient>,
    directory: Arc<dyn PersonDirectory>,
    internal_phone_type: Option<String>,
}

impl PersonOriginator {
    pub fn new(
        client: Arc<PbxClient>,
        directory: Arc<dyn PersonDirectory>,
        internal_phone_type: Option<String>,
    ) -> Self {
        Self {
            client,
            directory,
            internal_phone_type,
        }
    }

    /// Ring `person`'s internal phone and connect it to `to`.
    pub async fn originate(
        &self,
        person: PersonRef,
        to: &str,
        caller_id: &str,
    ) -> Result<OriginateStatus, SyncError> {
        let phone_type = self
            .internal_phone_type
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or(SyncError::ConfigurationMissing("the internal phone type"))?;

        let from = self
            .directory
            .number_of_person(person, phone_type)
            .await?
            .ok_or_else(|| {
                SyncError::OriginateRejected(format!(
                    "There is no {} phone number configured.",
                    phone_type.to_lowercase()
                ))
            })?;

        debug!(person, from = %from, "originating call for person");
        self.client.originate(&from, to, caller_id).await
    }
}
