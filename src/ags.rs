//! Assignment and Grade Services: line items, scores and results
//!
//! A [`GradeService`] belongs to one launched session. It keeps the line
//! items and grade records it has seen, refreshing from the platform only on
//! a local miss. `resourceId` identifies a line item locally and `scoreOf`
//! ties a grade record to its line item.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::lms::{LmsClient, LmsRequest};
use crate::session::{SessionContext, keys};
use crate::transport::{Body, media};
use crate::{Error, Result};

/// AGS OAuth scopes
pub mod scopes {
    /// Read line items
    pub const LINE_ITEM_READONLY: &str =
        "https://purl.imsglobal.org/spec/lti-ags/scope/lineitem.readonly";
    /// Manage line items
    pub const LINE_ITEM: &str = "https://purl.imsglobal.org/spec/lti-ags/scope/lineitem";
    /// Read results
    pub const RESULT_READONLY: &str =
        "https://purl.imsglobal.org/spec/lti-ags/scope/result.readonly";
    /// Post scores
    pub const SCORE: &str = "https://purl.imsglobal.org/spec/lti-ags/scope/score";

    /// Every AGS scope
    pub const ALL: [&str; 4] = [LINE_ITEM_READONLY, LINE_ITEM, RESULT_READONLY, SCORE];
}

/// A gradebook column
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    /// Platform-assigned URL of the line item
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Maximum score
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score_maximum: Option<f64>,
    /// Tool resource id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    /// Tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Resource link the line item is bound to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_link_id: Option<String>,
    /// Legacy link id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lti_link_id: Option<String>,
    /// Submission window start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date_time: Option<String>,
    /// Submission window end
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date_time: Option<String>,
}

impl LineItem {
    /// Take the identifiers the platform assigned from `platform`
    fn adopt(&mut self, platform: &LineItem) {
        self.id.clone_from(&platform.id);
        self.resource_link_id.clone_from(&platform.resource_link_id);
        self.tag.clone_from(&platform.tag);
        self.lti_link_id.clone_from(&platform.lti_link_id);
        if self.label.is_none() {
            self.label.clone_from(&platform.label);
        }
    }
}

/// A result row of a line item
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeRecord {
    /// Result URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Platform user id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Score
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_score: Option<f64>,
    /// Maximum score
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_maximum: Option<f64>,
    /// Line item URL this result belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score_of: Option<String>,
    /// Last modification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// Learner's progress on the activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityProgress {
    /// Not started
    Initialized,
    /// Started
    Started,
    /// In progress
    InProgress,
    /// Submitted
    Submitted,
    /// Completed
    Completed,
}

/// Status of grading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GradingProgress {
    /// Final grade
    FullyGraded,
    /// Grading pending
    Pending,
    /// Needs manual grading
    PendingManual,
    /// Grading failed
    Failed,
    /// Not ready
    NotReady,
}

/// A score posted to a line item
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    /// Score achieved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score_given: Option<f64>,
    /// Maximum score
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score_maximum: Option<f64>,
    /// Activity progress
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_progress: Option<ActivityProgress>,
    /// Grading progress
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grading_progress: Option<GradingProgress>,
    /// Platform user id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Comment shown to the learner
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// When the score was given (RFC 3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl Progress {
    /// A completed, fully graded score
    #[must_use]
    pub fn completed(score_given: f64, score_maximum: f64) -> Self {
        Self {
            score_given: Some(score_given),
            score_maximum: Some(score_maximum),
            activity_progress: Some(ActivityProgress::Completed),
            grading_progress: Some(GradingProgress::FullyGraded),
            ..Self::default()
        }
    }

    /// Attach a comment
    #[must_use]
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

/// URL of the `scores` / `results` collection under a line item URL.
///
/// The query string stays at the end:
/// `.../lineitems/5?type_id=4` becomes `.../lineitems/5/scores?type_id=4`.
#[must_use]
pub fn sub_resource_url(line_item_url: &str, collection: &str) -> String {
    let (path, query) = match line_item_url.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (line_item_url, None),
    };
    let slash = if path.ends_with('/') { "" } else { "/" };
    match query {
        Some(query) => format!("{path}{slash}{collection}?{query}"),
        None => format!("{path}{slash}{collection}"),
    }
}

/// Line item and grade operations for one launched session
pub struct GradeService {
    client: LmsClient,
    line_items_url: Option<String>,
    sub: Option<String>,
    line_items: Vec<LineItem>,
    grades: Vec<GradeRecord>,
}

impl GradeService {
    /// Service for the session described by `context`
    #[must_use]
    pub fn new(client: LmsClient, context: &SessionContext) -> Self {
        Self {
            client,
            line_items_url: context.line_items_url.clone(),
            sub: context.sub.clone(),
            line_items: Vec::new(),
            grades: Vec::new(),
        }
    }

    /// Cached line items
    #[must_use]
    pub fn line_items(&self) -> &[LineItem] {
        &self.line_items
    }

    /// Cached grade records
    #[must_use]
    pub fn grades(&self) -> &[GradeRecord] {
        &self.grades
    }

    fn line_items_url(&self) -> Result<&str> {
        self.line_items_url
            .as_deref()
            .ok_or(Error::MissingSessionValue(keys::LINE_ITEMS))
    }

    /// Replace the cached line items with the platform's list
    pub async fn refresh_line_items(&mut self) -> Result<&[LineItem]> {
        let url = self.line_items_url()?.to_string();
        let request = LmsRequest::get(url)
            .accept(media::LINE_ITEM_CONTAINER)
            .content_type(media::JSON)
            .with_token(&scopes::ALL);
        self.line_items = self.client.send(request).await?.json()?;
        debug!(count = self.line_items.len(), "Refreshed line items");
        Ok(&self.line_items)
    }

    /// Index of the cached line item with `resource_id`
    #[must_use]
    pub fn find_line_item_index_by_resource_id(&self, resource_id: &str) -> Option<usize> {
        self.line_items
            .iter()
            .position(|item| item.resource_id.as_deref() == Some(resource_id))
    }

    /// Cached line items carrying `tag`
    #[must_use]
    pub fn find_line_items_by_tag(&self, tag: &str) -> Vec<&LineItem> {
        self.line_items
            .iter()
            .filter(|item| item.tag.as_deref() == Some(tag))
            .collect()
    }

    fn find_index(&self, resource_id: Option<&str>) -> Option<usize> {
        resource_id.and_then(|id| self.find_line_item_index_by_resource_id(id))
    }

    /// Return the platform line item for `item.resource_id`, creating it if
    /// the platform has none.
    ///
    /// Looks in the local cache, then in a refreshed list. Only when both
    /// miss is the item posted.
    pub async fn find_or_create_line_item(&mut self, mut item: LineItem) -> Result<LineItem> {
        let mut index = self.find_index(item.resource_id.as_deref());
        if index.is_none() {
            self.refresh_line_items().await?;
            index = self.find_index(item.resource_id.as_deref());
        }

        if let Some(index) = index {
            item.adopt(&self.line_items[index]);
            self.line_items[index] = item.clone();
            return Ok(item);
        }

        let url = self.line_items_url()?.to_string();
        let request = LmsRequest::post(url, Body::json(&item)?)
            .accept(media::LINE_ITEM)
            .content_type(media::LINE_ITEM)
            .with_token(&scopes::ALL);
        let response = self.client.send(request).await?;
        match response.json::<LineItem>() {
            Ok(created) if created.id.is_some() => item.adopt(&created),
            Ok(_) => debug!("Line item response carried no id"),
            Err(e) => debug!(error = %e, "Line item response carried no body"),
        }

        if item.id.is_none() {
            // Learn the platform id from the listing instead
            self.refresh_line_items().await?;
            let Some(index) = self.find_index(item.resource_id.as_deref()) else {
                warn!(
                    resource_id = item.resource_id.as_deref().unwrap_or_default(),
                    "Created line item is not listed by the platform"
                );
                return Ok(item);
            };
            item.adopt(&self.line_items[index]);
            self.line_items[index] = item.clone();
        } else {
            self.line_items.push(item.clone());
        }

        info!(
            resource_id = item.resource_id.as_deref().unwrap_or_default(),
            id = item.id.as_deref().unwrap_or_default(),
            "Created line item"
        );
        Ok(item)
    }

    /// Line item URL for `resource_id`, if cached and addressable
    fn line_item_url(&self, resource_id: &str) -> Option<String> {
        let index = self.find_line_item_index_by_resource_id(resource_id)?;
        self.line_items[index].id.clone()
    }

    /// Grade records of the line item with `resource_id`.
    ///
    /// `Ok(None)` when no such line item is cached.
    pub async fn get_grade(&mut self, resource_id: &str) -> Result<Option<Vec<GradeRecord>>> {
        let Some(url) = self.line_item_url(resource_id) else {
            return Ok(None);
        };

        let cached: Vec<_> = self
            .grades
            .iter()
            .filter(|g| g.score_of.as_deref() == Some(url.as_str()))
            .cloned()
            .collect();
        if !cached.is_empty() {
            return Ok(Some(cached));
        }

        let request = LmsRequest::get(sub_resource_url(&url, "results"))
            .accept(media::RESULT_CONTAINER)
            .content_type(media::JSON)
            .with_token(&scopes::ALL);
        let fetched: Vec<GradeRecord> = self.client.send(request).await?.json()?;
        debug!(line_item = %url, count = fetched.len(), "Fetched results");
        self.grades.extend(fetched.iter().cloned());
        Ok(Some(fetched))
    }

    /// Post `progress` to the line item with `resource_id`.
    ///
    /// `userId` defaults to the session subject and `timestamp` to now.
    /// `Ok(None)` when no such line item is cached.
    pub async fn set_grade(
        &mut self,
        mut progress: Progress,
        resource_id: &str,
    ) -> Result<Option<Progress>> {
        let Some(url) = self.line_item_url(resource_id) else {
            return Ok(None);
        };

        if progress.user_id.is_none() {
            progress.user_id.clone_from(&self.sub);
        }
        if progress.timestamp.is_none() {
            progress.timestamp = Some(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
        }

        let request = LmsRequest::post(sub_resource_url(&url, "scores"), Body::json(&progress)?)
            .accept(media::JSON)
            .content_type(media::SCORE)
            .with_token(&scopes::ALL);
        self.client.send(request).await?;
        info!(line_item = %url, "Posted score");
        Ok(Some(progress))
    }
}
