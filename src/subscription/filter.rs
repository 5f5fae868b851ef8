use std::sync::LazyLock;

use regex::Regex;

use crate::error::{ClientError, ErrorCode};

/// Default number of events the server scans before sending a checkpoint.
pub const DEFAULT_MAX_SEARCH_WINDOW: u32 = 32;

static NON_SYSTEM_EVENT_TYPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\$].*").expect("static regex is valid"));

/// What a filter expression is matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterTarget {
    StreamName,
    EventType,
}

#[derive(Debug, Clone)]
pub enum FilterExpression {
    /// Matches when the value starts with any of the prefixes.
    Prefixes(Vec<String>),
    Regex(Regex),
}

/// Server-side filter of a `$all` subscription or read.
#[derive(Debug, Clone)]
pub struct SubscriptionFilter {
    target: FilterTarget,
    expression: FilterExpression,
    max_search_window: Option<u32>,
    checkpoint_interval_multiplier: u32,
}

impl SubscriptionFilter {
    pub fn on_stream_name() -> Self {
        Self::new(FilterTarget::StreamName)
    }

    pub fn on_event_type() -> Self {
        Self::new(FilterTarget::EventType)
    }

    /// Skips system events, whose types start with `$`.
    pub fn exclude_system_events() -> Self {
        Self {
            expression: FilterExpression::Regex(NON_SYSTEM_EVENT_TYPE.clone()),
            ..Self::on_event_type()
        }
    }

    fn new(target: FilterTarget) -> Self {
        Self {
            target,
            expression: FilterExpression::Prefixes(Vec::new()),
            max_search_window: Some(DEFAULT_MAX_SEARCH_WINDOW),
            checkpoint_interval_multiplier: 1,
        }
    }

    /// Adds a prefix, replacing any regex set before.
    pub fn add_prefix(mut self, prefix: impl Into<String>) -> Self {
        match &mut self.expression {
            FilterExpression::Prefixes(prefixes) => prefixes.push(prefix.into()),
            FilterExpression::Regex(_) => {
                self.expression = FilterExpression::Prefixes(vec![prefix.into()])
            }
        }
        self
    }

    /// Matches with `pattern`, replacing any prefixes set before.
    pub fn regex(mut self, pattern: &str) -> Result<Self, ClientError> {
        let regex = Regex::new(pattern).map_err(|e| {
            ClientError::from_error(
                ErrorCode::Parsing,
                format!("invalid filter regex '{pattern}'"),
                e,
            )
        })?;
        self.expression = FilterExpression::Regex(regex);
        Ok(self)
    }

    /// Events scanned without a match before a checkpoint is sent.
    /// `None` lets the server decide.
    pub fn with_max_search_window(mut self, window: Option<u32>) -> Self {
        self.max_search_window = window;
        self
    }

    pub fn with_checkpoint_interval_multiplier(mut self, multiplier: u32) -> Self {
        self.checkpoint_interval_multiplier = multiplier.max(1);
        self
    }

    pub fn target(&self) -> FilterTarget {
        self.target
    }

    pub fn expression(&self) -> &FilterExpression {
        &self.expression
    }

    pub fn max_search_window(&self) -> Option<u32> {
        self.max_search_window
    }

    pub fn checkpoint_interval_multiplier(&self) -> u32 {
        self.checkpoint_interval_multiplier
    }

    /// Applies the filter the way the server does.
    pub fn matches(&self, stream: &str, event_type: &str) -> bool {
        let value = match self.target {
            FilterTarget::StreamName => stream,
            FilterTarget::EventType => event_type,
        };
        match &self.expression {
            FilterExpression::Prefixes(prefixes) => {
                prefixes.is_empty() || prefixes.iter().any(|p| value.starts_with(p.as_str()))
            }
            FilterExpression::Regex(regex) => regex.is_match(value),
        }
    }
}
