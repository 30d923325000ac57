//! Connection target: which worksheet, as whom.

use url::Url;

use crate::config::ConfigError;
use crate::protocol::{SyncRequest, UserId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTarget {
    /// Workbook id
    pub document_id: String,
    /// Worksheet id within the workbook
    pub sub_document_id: String,
    pub actor_id: UserId,
    pub actor_email: String,
}

impl SessionTarget {
    pub fn new(
        document_id: impl Into<String>,
        sub_document_id: impl Into<String>,
        actor_id: impl Into<UserId>,
        actor_email: impl Into<String>,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            sub_document_id: sub_document_id.into(),
            actor_id: actor_id.into(),
            actor_email: actor_email.into(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.document_id.is_empty() {
            return Err(ConfigError::MissingValue("document_id"));
        }
        if self.sub_document_id.is_empty() {
            return Err(ConfigError::MissingValue("sub_document_id"));
        }
        if self.actor_id.is_empty() {
            return Err(ConfigError::MissingValue("actor_id"));
        }
        Ok(())
    }

    /// `{base}/workbooks/{doc}/worksheets/{sheet}/collaborate?user_id=..&email=..`
    ///
    /// Ids are percent-encoded as path segments, so an id containing `/`
    /// cannot escape its segment.
    pub fn endpoint(&self, base: &Url) -> Result<Url, ConfigError> {
        self.validate()?;
        let mut url = base.clone();
        url.path_segments_mut()
            .map_err(|_| ConfigError::InvalidUrl(format!("{base}: cannot carry a path")))?
            .pop_if_empty()
            .extend([
                "workbooks",
                self.document_id.as_str(),
                "worksheets",
                self.sub_document_id.as_str(),
                "collaborate",
            ]);
        url.query_pairs_mut()
            .clear()
            .append_pair("user_id", &self.actor_id)
            .append_pair("email", &self.actor_email);
        Ok(url)
    }

    pub fn sync_request(&self) -> SyncRequest {
        SyncRequest {
            workbook_id: Some(self.document_id.clone()),
            worksheet_id: Some(self.sub_document_id.clone()),
        }
    }
}
