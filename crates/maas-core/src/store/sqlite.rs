use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row};

use super::{apply_update, ensure_terminal_outcome, TaskUpdate, WorkflowStore};
use crate::db::Database;
use crate::error::OrchestratorError;
use crate::models::{
    AgentFailure, AgentKind, AgentResult, AgentTask, FailureKind, HumanFeedback, Proposal,
    TaskStatus, Workflow, WorkflowOutcome, WorkflowStatus, WorkflowSummary, WorkflowType,
};

/// SQLite-backed [`WorkflowStore`].
///
/// Task transitions touch only their own `workflow_tasks` row plus the
/// matching child record, inside one transaction.
pub struct SqliteWorkflowStore {
    db: Database,
}

impl SqliteWorkflowStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

#[async_trait]
impl WorkflowStore for SqliteWorkflowStore {
    async fn create(&self, proposal: &Proposal, workflow: &Workflow) -> Result<(), OrchestratorError> {
        let proposal = proposal.clone();
        let wf = workflow.clone();
        self.db
            .transaction_async(move |tx| {
                if workflow_status(tx, &wf.id)?.is_some() {
                    return Err(OrchestratorError::Conflict(format!(
                        "workflow {} already exists",
                        wf.id
                    )));
                }
                // Proposals are immutable: a resubmission keeps the first copy.
                tx.execute(
                    "INSERT INTO proposals (id, title, content, metadata, submitted_by, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(id) DO NOTHING",
                    rusqlite::params![
                        proposal.id,
                        proposal.title,
                        proposal.content,
                        serde_json::to_string(&proposal.metadata)?,
                        proposal.submitted_by,
                        proposal.created_at.timestamp_millis(),
                    ],
                )?;
                tx.execute(
                    "INSERT INTO workflows (id, proposal_id, workflow_type, status, recommendation,
                                            diagnostics, created_at, updated_at, completed_at)
                     VALUES (?1, ?2, ?3, ?4, NULL, '[]', ?5, ?6, NULL)",
                    rusqlite::params![
                        wf.id,
                        wf.proposal_id,
                        wf.workflow_type.as_str(),
                        wf.status.as_str(),
                        wf.created_at.timestamp_millis(),
                        wf.updated_at.timestamp_millis(),
                    ],
                )?;
                for (position, task) in wf.plan.iter().enumerate() {
                    tx.execute(
                        "INSERT INTO workflow_tasks (workflow_id, id, position, kind, dependencies,
                                                     policy, status, attempts)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                        rusqlite::params![
                            wf.id,
                            task.id,
                            position as i64,
                            task.kind.as_str(),
                            serde_json::to_string(&task.dependencies)?,
                            serde_json::to_string(&task.policy)?,
                            task.status.as_str(),
                            task.attempts,
                        ],
                    )?;
                }
                Ok(())
            })
            .await
    }

    async fn get(&self, workflow_id: &str) -> Result<Workflow, OrchestratorError> {
        let id = workflow_id.to_string();
        self.db
            .transaction_async(move |tx| {
                load_workflow(tx, &id)?
                    .ok_or_else(|| OrchestratorError::NotFound(format!("workflow {}", id)))
            })
            .await
    }

    async fn get_proposal(&self, proposal_id: &str) -> Result<Proposal, OrchestratorError> {
        let id = proposal_id.to_string();
        let proposal = self
            .db
            .with_conn_async({
                let id = id.clone();
                move |conn| {
                    conn.query_row(
                        "SELECT id, title, content, metadata, submitted_by, created_at
                         FROM proposals WHERE id = ?1",
                        rusqlite::params![id],
                        row_to_proposal,
                    )
                    .optional()
                }
            })
            .await?;
        proposal.ok_or_else(|| OrchestratorError::NotFound(format!("proposal {}", id)))
    }

    async fn mark_running(&self, workflow_id: &str) -> Result<bool, OrchestratorError> {
        let id = workflow_id.to_string();
        self.db
            .transaction_async(move |tx| {
                let status = workflow_status(tx, &id)?
                    .ok_or_else(|| OrchestratorError::NotFound(format!("workflow {}", id)))?;
                if status != WorkflowStatus::Pending {
                    return Ok(false);
                }
                tx.execute(
                    "UPDATE workflows SET status = ?1, updated_at = ?2 WHERE id = ?3",
                    rusqlite::params![
                        WorkflowStatus::Running.as_str(),
                        Utc::now().timestamp_millis(),
                        id
                    ],
                )?;
                Ok(true)
            })
            .await
    }

    async fn update_task(
        &self,
        workflow_id: &str,
        task_id: &str,
        update: TaskUpdate,
    ) -> Result<AgentTask, OrchestratorError> {
        let workflow_id = workflow_id.to_string();
        let task_id = task_id.to_string();
        self.db
            .transaction_async(move |tx| {
                let mut task = tx
                    .query_row(
                        &format!("{} WHERE workflow_id = ?1 AND id = ?2", TASK_SELECT),
                        rusqlite::params![workflow_id, task_id],
                        row_to_task,
                    )
                    .optional()?
                    .ok_or_else(|| {
                        OrchestratorError::NotFound(format!(
                            "task {} in workflow {}",
                            task_id, workflow_id
                        ))
                    })?;

                let now = Utc::now();
                apply_update(&mut task, &update, now)?;

                tx.execute(
                    "UPDATE workflow_tasks
                     SET status = ?1, attempts = ?2, skip_reason = ?3, started_at = ?4, finished_at = ?5
                     WHERE workflow_id = ?6 AND id = ?7",
                    rusqlite::params![
                        task.status.as_str(),
                        task.attempts,
                        task.skip_reason,
                        task.started_at.map(|t| t.timestamp_millis()),
                        task.finished_at.map(|t| t.timestamp_millis()),
                        workflow_id,
                        task_id,
                    ],
                )?;

                match &update {
                    TaskUpdate::Succeeded(result) => insert_result(tx, &workflow_id, result)?,
                    TaskUpdate::Failed(failure) => insert_failure(tx, &workflow_id, failure)?,
                    TaskUpdate::Running { .. } | TaskUpdate::Skipped { .. } => {}
                }

                tx.execute(
                    "UPDATE workflows SET updated_at = ?1 WHERE id = ?2",
                    rusqlite::params![now.timestamp_millis(), workflow_id],
                )?;
                Ok(task)
            })
            .await
    }

    async fn finalize(
        &self,
        workflow_id: &str,
        outcome: &WorkflowOutcome,
    ) -> Result<bool, OrchestratorError> {
        ensure_terminal_outcome(outcome)?;
        let id = workflow_id.to_string();
        let outcome = outcome.clone();
        self.db
            .transaction_async(move |tx| {
                let status = workflow_status(tx, &id)?
                    .ok_or_else(|| OrchestratorError::NotFound(format!("workflow {}", id)))?;
                if status.is_terminal() {
                    return Ok(false);
                }
                let unfinished: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM workflow_tasks
                     WHERE workflow_id = ?1 AND status IN ('PENDING', 'RUNNING')",
                    rusqlite::params![id],
                    |row| row.get(0),
                )?;
                if unfinished > 0 {
                    return Err(OrchestratorError::Conflict(format!(
                        "workflow {} still has {} unfinished tasks",
                        id, unfinished
                    )));
                }
                let recommendation = outcome
                    .recommendation
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?;
                let now = Utc::now().timestamp_millis();
                tx.execute(
                    "UPDATE workflows
                     SET status = ?1, recommendation = ?2, diagnostics = ?3, updated_at = ?4, completed_at = ?4
                     WHERE id = ?5",
                    rusqlite::params![
                        outcome.status.as_str(),
                        recommendation,
                        serde_json::to_string(&outcome.diagnostics)?,
                        now,
                        id,
                    ],
                )?;
                Ok(true)
            })
            .await
    }

    async fn append_feedback(
        &self,
        workflow_id: &str,
        feedback: HumanFeedback,
    ) -> Result<HumanFeedback, OrchestratorError> {
        let id = workflow_id.to_string();
        self.db
            .transaction_async(move |tx| {
                if workflow_status(tx, &id)?.is_none() {
                    return Err(OrchestratorError::NotFound(format!("workflow {}", id)));
                }
                if let Some(task_id) = &feedback.task_id {
                    let exists: Option<i64> = tx
                        .query_row(
                            "SELECT 1 FROM workflow_tasks WHERE workflow_id = ?1 AND id = ?2",
                            rusqlite::params![id, task_id],
                            |row| row.get(0),
                        )
                        .optional()?;
                    if exists.is_none() {
                        return Err(OrchestratorError::NotFound(format!(
                            "task {} in workflow {}",
                            task_id, id
                        )));
                    }
                }
                let seq: i64 = tx.query_row(
                    "SELECT COALESCE(MAX(seq), 0) + 1 FROM human_feedback WHERE workflow_id = ?1",
                    rusqlite::params![id],
                    |row| row.get(0),
                )?;
                let stored = HumanFeedback {
                    seq: seq as u64,
                    workflow_id: id.clone(),
                    ..feedback
                };
                tx.execute(
                    "INSERT INTO human_feedback (workflow_id, seq, task_id, annotation, rating, author, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        stored.workflow_id,
                        seq,
                        stored.task_id,
                        stored.annotation,
                        stored.rating,
                        stored.author,
                        stored.created_at.timestamp_millis(),
                    ],
                )?;
                tx.execute(
                    "UPDATE workflows SET updated_at = ?1 WHERE id = ?2",
                    rusqlite::params![Utc::now().timestamp_millis(), id],
                )?;
                Ok(stored)
            })
            .await
    }

    async fn list_by_status(&self, status: WorkflowStatus) -> Result<Vec<Workflow>, OrchestratorError> {
        self.db
            .transaction_async(move |tx| {
                let ids = select_ids(tx, Some(status), i64::MAX, 0)?;
                load_all(tx, &ids)
            })
            .await
    }

    async fn list(
        &self,
        status: Option<WorkflowStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<WorkflowSummary>, usize), OrchestratorError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let offset = i64::try_from(offset).unwrap_or(i64::MAX);
        self.db
            .transaction_async(move |tx| {
                let total: i64 = match status {
                    Some(s) => tx.query_row(
                        "SELECT COUNT(*) FROM workflows WHERE status = ?1",
                        rusqlite::params![s.as_str()],
                        |row| row.get(0),
                    )?,
                    None => tx.query_row("SELECT COUNT(*) FROM workflows", [], |row| row.get(0))?,
                };
                let ids = select_ids(tx, status, limit, offset)?;
                let page: Vec<WorkflowSummary> =
                    load_all(tx, &ids)?.iter().map(Workflow::summary).collect();
                Ok((page, total as usize))
            })
            .await
    }
}

const TASK_SELECT: &str = "SELECT id, workflow_id, kind, dependencies, policy, status, attempts,
                                  skip_reason, started_at, finished_at
                           FROM workflow_tasks";

fn workflow_status(conn: &Connection, id: &str) -> Result<Option<WorkflowStatus>, OrchestratorError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT status FROM workflows WHERE id = ?1",
            rusqlite::params![id],
            |row| row.get(0),
        )
        .optional()?;
    raw.map(|s| {
        WorkflowStatus::from_str(&s)
            .ok_or_else(|| OrchestratorError::Database(format!("unknown workflow status '{}'", s)))
    })
    .transpose()
}

fn select_ids(
    conn: &Connection,
    status: Option<WorkflowStatus>,
    limit: i64,
    offset: i64,
) -> Result<Vec<String>, OrchestratorError> {
    let ids = match status {
        Some(s) => {
            let mut stmt = conn.prepare(
                "SELECT id FROM workflows WHERE status = ?1
                 ORDER BY created_at DESC, id LIMIT ?2 OFFSET ?3",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![s.as_str(), limit, offset], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            rows
        }
        None => {
            let mut stmt = conn.prepare(
                "SELECT id FROM workflows ORDER BY created_at DESC, id LIMIT ?1 OFFSET ?2",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![limit, offset], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            rows
        }
    };
    Ok(ids)
}

fn load_all(conn: &Connection, ids: &[String]) -> Result<Vec<Workflow>, OrchestratorError> {
    let mut workflows = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(wf) = load_workflow(conn, id)? {
            workflows.push(wf);
        }
    }
    Ok(workflows)
}

fn load_workflow(conn: &Connection, id: &str) -> Result<Option<Workflow>, OrchestratorError> {
    let header = conn
        .query_row(
            "SELECT id, proposal_id, workflow_type, status, recommendation, diagnostics,
                    created_at, updated_at, completed_at
             FROM workflows WHERE id = ?1",
            rusqlite::params![id],
            row_to_workflow,
        )
        .optional()?;
    let Some(mut wf) = header else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(&format!("{} WHERE workflow_id = ?1 ORDER BY position", TASK_SELECT))?;
    wf.plan = stmt
        .query_map(rusqlite::params![id], row_to_task)?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT r.task_id, r.agent, r.findings, r.score, r.summary, r.inputs, r.created_at
         FROM agent_results r
         JOIN workflow_tasks t ON t.workflow_id = r.workflow_id AND t.id = r.task_id
         WHERE r.workflow_id = ?1 ORDER BY t.position",
    )?;
    wf.results = stmt
        .query_map(rusqlite::params![id], row_to_result)?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT f.task_id, f.agent, f.kind, f.message, f.retryable, f.attempts, f.created_at
         FROM agent_failures f
         JOIN workflow_tasks t ON t.workflow_id = f.workflow_id AND t.id = f.task_id
         WHERE f.workflow_id = ?1 ORDER BY t.position",
    )?;
    wf.failures = stmt
        .query_map(rusqlite::params![id], row_to_failure)?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT seq, workflow_id, task_id, annotation, rating, author, created_at
         FROM human_feedback WHERE workflow_id = ?1 ORDER BY seq",
    )?;
    wf.feedback = stmt
        .query_map(rusqlite::params![id], row_to_feedback)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(wf))
}

fn insert_result(conn: &Connection, workflow_id: &str, result: &AgentResult) -> Result<(), OrchestratorError> {
    conn.execute(
        "INSERT INTO agent_results (workflow_id, task_id, agent, findings, score, summary, inputs, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            workflow_id,
            result.task_id,
            result.agent.as_str(),
            serde_json::to_string(&result.findings)?,
            result.score,
            result.summary,
            serde_json::to_string(&result.inputs)?,
            result.created_at.timestamp_millis(),
        ],
    )?;
    Ok(())
}

fn insert_failure(conn: &Connection, workflow_id: &str, failure: &AgentFailure) -> Result<(), OrchestratorError> {
    conn.execute(
        "INSERT INTO agent_failures (workflow_id, task_id, agent, kind, message, retryable, attempts, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            workflow_id,
            failure.task_id,
            failure.agent.as_str(),
            failure.kind.as_str(),
            failure.message,
            failure.retryable,
            failure.attempts,
            failure.created_at.timestamp_millis(),
        ],
    )?;
    Ok(())
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

fn parse_column<T>(idx: usize, raw: &str, parsed: Option<T>) -> rusqlite::Result<T> {
    parsed.ok_or_else(|| rusqlite::Error::InvalidColumnType(idx, raw.to_string(), Type::Text))
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_proposal(row: &Row<'_>) -> rusqlite::Result<Proposal> {
    Ok(Proposal {
        id: row.get(0)?,
        title: row.get(1)?,
        content: row.get(2)?,
        metadata: json_column(row, 3)?,
        submitted_by: row.get(4)?,
        created_at: millis_to_datetime(row.get(5)?),
    })
}

fn row_to_workflow(row: &Row<'_>) -> rusqlite::Result<Workflow> {
    let workflow_type: String = row.get(2)?;
    let status: String = row.get(3)?;
    let recommendation: Option<String> = row.get(4)?;
    let recommendation = recommendation
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;
    Ok(Workflow {
        id: row.get(0)?,
        proposal_id: row.get(1)?,
        workflow_type: parse_column(2, &workflow_type, WorkflowType::from_str(&workflow_type))?,
        status: parse_column(3, &status, WorkflowStatus::from_str(&status))?,
        plan: Vec::new(),
        results: Vec::new(),
        failures: Vec::new(),
        feedback: Vec::new(),
        recommendation,
        diagnostics: json_column(row, 5)?,
        created_at: millis_to_datetime(row.get(6)?),
        updated_at: millis_to_datetime(row.get(7)?),
        completed_at: row.get::<_, Option<i64>>(8)?.map(millis_to_datetime),
    })
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<AgentTask> {
    let kind: String = row.get(2)?;
    let status: String = row.get(5)?;
    Ok(AgentTask {
        id: row.get(0)?,
        workflow_id: row.get(1)?,
        kind: parse_column(2, &kind, AgentKind::from_str(&kind))?,
        dependencies: json_column(row, 3)?,
        policy: json_column(row, 4)?,
        status: parse_column(5, &status, TaskStatus::from_str(&status))?,
        attempts: row.get(6)?,
        skip_reason: row.get(7)?,
        started_at: row.get::<_, Option<i64>>(8)?.map(millis_to_datetime),
        finished_at: row.get::<_, Option<i64>>(9)?.map(millis_to_datetime),
    })
}

fn row_to_result(row: &Row<'_>) -> rusqlite::Result<AgentResult> {
    let agent: String = row.get(1)?;
    Ok(AgentResult {
        task_id: row.get(0)?,
        agent: parse_column(1, &agent, AgentKind::from_str(&agent))?,
        findings: json_column(row, 2)?,
        score: row.get(3)?,
        summary: row.get(4)?,
        inputs: json_column(row, 5)?,
        created_at: millis_to_datetime(row.get(6)?),
    })
}

fn row_to_failure(row: &Row<'_>) -> rusqlite::Result<AgentFailure> {
    let agent: String = row.get(1)?;
    let kind: String = row.get(2)?;
    Ok(AgentFailure {
        task_id: row.get(0)?,
        agent: parse_column(1, &agent, AgentKind::from_str(&agent))?,
        kind: parse_column(2, &kind, FailureKind::from_str(&kind))?,
        message: row.get(3)?,
        retryable: row.get(4)?,
        attempts: row.get(5)?,
        created_at: millis_to_datetime(row.get(6)?),
    })
}

fn row_to_feedback(row: &Row<'_>) -> rusqlite::Result<HumanFeedback> {
    let seq: i64 = row.get(0)?;
    Ok(HumanFeedback {
        seq: seq as u64,
        workflow_id: row.get(1)?,
        task_id: row.get(2)?,
        annotation: row.get(3)?,
        rating: row.get(4)?,
        author: row.get(5)?,
        created_at: millis_to_datetime(row.get(6)?),
    })
}
