use crate::error::HarnessError;
use crate::process::{command_from_argv, run_with_timeout, ProcessOutcome};
use anyhow::{anyhow, Result};
use inhab_core::truncate_excerpt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::debug;

const SUMMARY_SECTION: &str = "summary";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerRequest {
    pub item_id: String,
    /// Only the interface sections revealed so far.
    pub interface: Value,
    /// Sections that exist but have not been revealed yet.
    pub hidden_sections: Vec<String>,
    pub targets: Vec<String>,
    pub seed: u64,
    pub attempt: usize,
    pub planning_call: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

/// Black-box plan author. Returns the raw reply text.
pub trait Planner {
    fn complete(&mut self, request: &PlannerRequest) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlannerReply {
    /// Plan-shaped JSON, not yet normalized.
    Plan(Value),
    NeedMore(Vec<String>),
}

/// Extracts a plan or a disclosure request from free-form planner text.
///
/// Accepts bare JSON, JSON inside a fenced code block, or the outermost
/// `{...}` slice of the text.
pub fn parse_planner_reply(text: &str) -> Result<PlannerReply, HarnessError> {
    let value = extract_json_object(text).ok_or_else(|| {
        HarnessError::new(format!(
            "planner reply contains no JSON object: {}",
            truncate_excerpt(text)
        ))
    })?;

    if let Some(need_more) = value.get("need_more") {
        let sections: Vec<String> = need_more
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if sections.is_empty() {
            return Err(HarnessError::new(
                "need_more must list at least one interface section name",
            ));
        }
        return Ok(PlannerReply::NeedMore(sections));
    }
    if value.get("calls").is_some() {
        return Ok(PlannerReply::Plan(value));
    }
    Err(HarnessError::new(
        "planner reply is neither a plan (missing \"calls\") nor a need_more request",
    ))
}

fn extract_json_object(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    let mut candidates: Vec<&str> = vec![trimmed];
    if let Some(fenced) = fenced_block(trimmed) {
        candidates.push(fenced);
    }
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            candidates.push(&trimmed[start..=end]);
        }
    }
    candidates
        .into_iter()
        .filter_map(|candidate| serde_json::from_str::<Value>(candidate.trim()).ok())
        .find(Value::is_object)
}

fn fenced_block(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after_open = &text[open + 3..];
    // Skip the info string (e.g. `json`) up to the end of the fence line.
    let body_start = after_open.find('\n')? + 1;
    let body = &after_open[body_start..];
    let close = body.find("```")?;
    Some(&body[..close])
}

/// Progressive reveal of a package interface made of named sections.
#[derive(Debug, Clone)]
pub struct InterfaceDisclosure {
    sections: Map<String, Value>,
    revealed: BTreeSet<String>,
}

impl InterfaceDisclosure {
    /// Starts with the `summary` section, or everything when there is none.
    pub fn new(interface: &Value) -> Self {
        let sections = match interface {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert(SUMMARY_SECTION.to_string(), other.clone());
                map
            }
        };
        let revealed = if sections.contains_key(SUMMARY_SECTION) {
            BTreeSet::from([SUMMARY_SECTION.to_string()])
        } else {
            sections.keys().cloned().collect()
        };
        Self { sections, revealed }
    }

    /// Reveals the named sections; returns those that were newly revealed.
    pub fn reveal(&mut self, names: &[String]) -> Vec<String> {
        names
            .iter()
            .filter(|name| self.sections.contains_key(name.as_str()))
            .filter(|name| self.revealed.insert((*name).clone()))
            .cloned()
            .collect()
    }

    pub fn view(&self) -> Value {
        let visible: Map<String, Value> = self
            .sections
            .iter()
            .filter(|(name, _)| self.revealed.contains(name.as_str()))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        Value::Object(visible)
    }

    pub fn hidden(&self) -> Vec<String> {
        self.sections
            .keys()
            .filter(|name| !self.revealed.contains(name.as_str()))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanningContext<'a> {
    pub item_id: &'a str,
    pub targets: &'a [String],
    pub seed: u64,
    pub attempt: usize,
    pub feedback: Option<&'a str>,
}

/// Asks the planner for a plan, serving `need_more` requests until the
/// call budget runs out. Exhausting the budget is a harness error.
/// `calls_made` is bumped once per planner invocation, failed ones included.
pub fn obtain_plan(
    planner: &mut dyn Planner,
    disclosure: &mut InterfaceDisclosure,
    ctx: &PlanningContext<'_>,
    max_planning_calls: usize,
    calls_made: &mut usize,
) -> Result<Value> {
    for call in 1..=max_planning_calls {
        let request = PlannerRequest {
            item_id: ctx.item_id.to_string(),
            interface: disclosure.view(),
            hidden_sections: disclosure.hidden(),
            targets: ctx.targets.to_vec(),
            seed: ctx.seed,
            attempt: ctx.attempt,
            planning_call: call,
            feedback: ctx.feedback.map(str::to_string),
        };
        *calls_made += 1;
        let text = planner.complete(&request)?;
        match parse_planner_reply(&text)? {
            PlannerReply::Plan(raw_plan) => return Ok(raw_plan),
            PlannerReply::NeedMore(sections) => {
                let revealed = disclosure.reveal(&sections);
                debug!(
                    item_id = ctx.item_id,
                    call,
                    requested = ?sections,
                    revealed = ?revealed,
                    "planner asked for more interface"
                );
            }
        }
    }
    Err(anyhow!(HarnessError::new(format!(
        "planning call budget of {} exhausted without a plan",
        max_planning_calls
    ))))
}

/// Runs an external planner command: request JSON on stdin, reply on stdout.
pub struct CommandPlanner {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandPlanner {
    pub fn new(argv: Vec<String>, timeout: Duration) -> Result<Self> {
        if argv.is_empty() {
            return Err(anyhow!("planner command must not be empty"));
        }
        Ok(Self { argv, timeout })
    }
}

impl Planner for CommandPlanner {
    fn complete(&mut self, request: &PlannerRequest) -> Result<String> {
        let cmd = command_from_argv(&self.argv)?;
        let stdin = serde_json::to_vec(request)?;
        let outcome = run_with_timeout(cmd, Some(stdin), self.timeout)?;
        match &outcome {
            ProcessOutcome::Exited {
                exit_code: Some(0),
                stdout,
                ..
            } => Ok(stdout.clone()),
            ProcessOutcome::Exited { stderr, .. } => Err(anyhow!(HarnessError::new(format!(
                "planner exited with status {}: {}",
                outcome.status_label(),
                truncate_excerpt(stderr)
            )))),
            ProcessOutcome::TimedOut => Err(anyhow!(HarnessError::new(format!(
                "planner did not reply within {}s",
                self.timeout.as_secs()
            )))),
        }
    }
}
