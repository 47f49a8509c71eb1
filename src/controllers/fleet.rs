/*
* File: src/controllers/fleet.rs
*
* Primitives of the worker-job fleet scaler. An InferenceService is backed by
* a dynamically sized pool of ephemeral distributed jobs (AscendJob, an
* externally defined resource kind read through `DynamicObject`). This module
* holds everything that can be computed without a cluster round-trip:
*
* - typed accessors over the job's untyped status (completion timestamp and
*   per-role replica-status record), decoupling the scaling logic from the
*   underlying JSON representation;
* - retirement of completed jobs that have outlived their grace window;
* - the scale plan, with its completed-before-running deletion priority;
* - status aggregation over heterogeneous per-job sub-status.
*
* The controller in inference_service_controller.rs drives the actual
* create/delete/list calls around these functions.
*
* SPDX-License-Identifier: Apache-2.0
*/

use chrono::{DateTime, Utc};
use kube::api::{ApiResource, DynamicObject, GroupVersionKind};
use kube::ResourceExt;
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

/// Group/version/kind of the distributed worker job resource.
pub const JOB_GROUP: &str = "mindxdl.gitee.com";
pub const JOB_VERSION: &str = "v1";
pub const JOB_KIND: &str = "AscendJob";

/// Role whose replica status determines a job instance's classification.
pub const PRIMARY_ROLE: &str = "Master";

/// Retention period for a completed job instance before reclamation, so logs
/// and diagnostics can still be collected.
pub const COMPLETED_JOB_GRACE_SECONDS: i64 = 300;

/// Length of the random suffix appended to job instance names.
pub const JOB_NAME_SUFFIX_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("job '{name}' has malformed status.completionTime: {reason}")]
    MalformedCompletionTime { name: String, reason: String },

    #[error("job '{name}' has malformed status.replicaStatuses: {reason}")]
    MalformedReplicaStatuses { name: String, reason: String },
}

/// Per-role replica counts reported by a worker job.
#[derive(Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplicaStatus {
    #[serde(default)]
    pub active: i32,
    #[serde(default)]
    pub failed: i32,
    #[serde(default)]
    pub succeeded: i32,
}

pub fn job_api_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(JOB_GROUP, JOB_VERSION, JOB_KIND))
}

/// New job instance name: the service name plus an 8-character random suffix.
pub fn job_instance_name(service_name: &str) -> String {
    let suffix: String = Uuid::new_v4()
        .to_string()
        .chars()
        .take(JOB_NAME_SUFFIX_LEN)
        .collect();
    format!("{}-{}", service_name, suffix)
}

/// Completion timestamp of a job instance; `None` while it is still running.
pub fn completion_time(job: &DynamicObject) -> Result<Option<DateTime<Utc>>, FleetError> {
    let raw = match job.data.pointer("/status/completionTime") {
        None => return Ok(None),
        Some(serde_json::Value::Null) => return Ok(None),
        Some(value) => value,
    };

    let text = raw.as_str().ok_or_else(|| FleetError::MalformedCompletionTime {
        name: job.name_any(),
        reason: "not a string".to_string(),
    })?;

    let parsed = DateTime::parse_from_rfc3339(text).map_err(|e| FleetError::MalformedCompletionTime {
        name: job.name_any(),
        reason: e.to_string(),
    })?;

    Ok(Some(parsed.with_timezone(&Utc)))
}

/// Replica-status record of the given role; `None` when the job has not
/// reported one yet (freshly created instances have no status at all).
pub fn replica_status(job: &DynamicObject, role: &str) -> Result<Option<ReplicaStatus>, FleetError> {
    let raw = match job
        .data
        .pointer("/status/replicaStatuses")
        .and_then(|statuses| statuses.get(role))
    {
        None => return Ok(None),
        Some(serde_json::Value::Null) => return Ok(None),
        Some(value) => value.clone(),
    };

    let status: ReplicaStatus =
        serde_json::from_value(raw).map_err(|e| FleetError::MalformedReplicaStatuses {
            name: job.name_any(),
            reason: e.to_string(),
        })?;

    Ok(Some(status))
}

/// Partition the owned job list into the working set and the expired set.
/// A job is expired once its completion timestamp plus the grace window has
/// elapsed; completed-but-within-grace and never-completed jobs are retained.
pub fn split_expired(
    jobs: Vec<DynamicObject>,
    now: DateTime<Utc>,
) -> Result<(Vec<DynamicObject>, Vec<DynamicObject>), FleetError> {
    let mut retained = Vec::with_capacity(jobs.len());
    let mut expired = Vec::new();

    for job in jobs {
        match completion_time(&job)? {
            Some(completed)
                if completed + chrono::Duration::seconds(COMPLETED_JOB_GRACE_SECONDS) <= now =>
            {
                expired.push(job)
            }
            _ => retained.push(job),
        }
    }

    Ok((retained, expired))
}

/// The mutation a single reconcile pass should apply to the fleet.
#[derive(Debug, PartialEq, Eq)]
pub enum ScalePlan {
    /// Create this many new instances.
    Grow(usize),
    /// Delete these instances, by name, in order.
    Shrink(Vec<String>),
    /// The fleet already has the target size.
    Hold,
}

/// Decide how to move the working list towards the target replica count.
///
/// On scale-down, instances that already carry a completion timestamp are
/// chosen first (in list order), and still-running instances are only touched
/// once no completed candidates remain. Scaling down never kills productive
/// work while idle capacity is available.
pub fn scale_plan(target: usize, jobs: &[DynamicObject]) -> Result<ScalePlan, FleetError> {
    let current = jobs.len();

    if target > current {
        return Ok(ScalePlan::Grow(target - current));
    }
    if target == current {
        return Ok(ScalePlan::Hold);
    }

    let quota = current - target;
    let mut doomed = Vec::with_capacity(quota);
    let mut running = Vec::new();

    for job in jobs {
        if doomed.len() >= quota {
            break;
        }
        if completion_time(job)?.is_some() {
            doomed.push(job.name_any());
        } else {
            running.push(job.name_any());
        }
    }

    for name in running {
        if doomed.len() >= quota {
            break;
        }
        doomed.push(name);
    }

    Ok(ScalePlan::Shrink(doomed))
}

/// Aggregated classification of every instance in the fleet.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FleetTally {
    pub total: usize,
    pub running: usize,
    pub failed: usize,
    pub pending: usize,
}

/// Classify each instance by its primary-role replica status: no record yet
/// is pending, active counts as running, failed (and not active) as failed,
/// anything else as pending.
pub fn aggregate(jobs: &[DynamicObject]) -> Result<FleetTally, FleetError> {
    let mut tally = FleetTally {
        total: jobs.len(),
        ..Default::default()
    };

    for job in jobs {
        match replica_status(job, PRIMARY_ROLE)? {
            None => tally.pending += 1,
            Some(status) if status.active > 0 => tally.running += 1,
            Some(status) if status.failed > 0 => tally.failed += 1,
            Some(_) => tally.pending += 1,
        }
    }

    Ok(tally)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn job(name: &str, status: serde_json::Value) -> DynamicObject {
        let mut job = DynamicObject::new(name, &job_api_resource()).within("default");
        job.data = json!({ "status": status });
        job
    }

    fn bare_job(name: &str) -> DynamicObject {
        DynamicObject::new(name, &job_api_resource()).within("default")
    }

    fn completed_at(name: &str, ts: &str) -> DynamicObject {
        job(name, json!({ "completionTime": ts }))
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn job_instance_names_carry_random_suffix() {
        let a = job_instance_name("chat");
        let b = job_instance_name("chat");
        assert!(a.starts_with("chat-"));
        assert_eq!(a.len(), "chat-".len() + JOB_NAME_SUFFIX_LEN);
        assert_ne!(a, b);
    }

    #[test]
    fn completion_time_absent_while_running() {
        assert_eq!(completion_time(&bare_job("a")).unwrap(), None);
        let pending = job("b", json!({ "replicaStatuses": {} }));
        assert_eq!(completion_time(&pending).unwrap(), None);
    }

    #[test]
    fn completion_time_must_be_rfc3339() {
        let bad = job("a", json!({ "completionTime": "yesterday" }));
        assert!(matches!(
            completion_time(&bad),
            Err(FleetError::MalformedCompletionTime { .. })
        ));
        let worse = job("b", json!({ "completionTime": 42 }));
        assert!(completion_time(&worse).is_err());
    }

    #[test]
    fn replica_status_missing_role_is_none() {
        assert_eq!(replica_status(&bare_job("a"), PRIMARY_ROLE).unwrap(), None);
        let other_role = job("b", json!({ "replicaStatuses": { "Worker": { "active": 1 } } }));
        assert_eq!(replica_status(&other_role, PRIMARY_ROLE).unwrap(), None);
    }

    #[test]
    fn replica_status_reads_primary_role_counts() {
        let j = job(
            "a",
            json!({ "replicaStatuses": { "Master": { "active": 1, "failed": 0 } } }),
        );
        let status = replica_status(&j, PRIMARY_ROLE).unwrap().unwrap();
        assert_eq!(status.active, 1);
        assert_eq!(status.failed, 0);
        assert_eq!(status.succeeded, 0);
    }

    #[test]
    fn replica_status_rejects_malformed_record() {
        let j = job("a", json!({ "replicaStatuses": { "Master": "broken" } }));
        assert!(matches!(
            replica_status(&j, PRIMARY_ROLE),
            Err(FleetError::MalformedReplicaStatuses { .. })
        ));
    }

    #[test]
    fn grace_window_retains_recent_completions() {
        // Completed 100s ago: inside the 300s window, must be retained.
        let recent = completed_at("recent", "2025-06-01T11:58:20+00:00");
        // Completed 301s ago: expired, must be retired.
        let stale = completed_at("stale", "2025-06-01T11:54:59+00:00");
        let live = bare_job("live");

        let (kept, expired) = split_expired(vec![recent, stale, live], now()).unwrap();
        let kept: Vec<_> = kept.iter().map(|j| j.name_any()).collect();
        let expired: Vec<_> = expired.iter().map(|j| j.name_any()).collect();
        assert_eq!(kept, vec!["recent", "live"]);
        assert_eq!(expired, vec!["stale"]);
    }

    #[test]
    fn grace_window_boundary_is_inclusive() {
        // Exactly completion + 300s: reclaimable.
        let boundary = completed_at("boundary", "2025-06-01T11:55:00+00:00");
        let (kept, expired) = split_expired(vec![boundary], now()).unwrap();
        assert!(kept.is_empty());
        assert_eq!(expired.len(), 1);
    }

    #[test]
    fn scale_plan_grows_from_empty_fleet() {
        // replicas=2 against an empty job list: exactly two creations.
        assert_eq!(scale_plan(2, &[]).unwrap(), ScalePlan::Grow(2));
    }

    #[test]
    fn scale_plan_holds_at_target() {
        let jobs = vec![bare_job("a"), bare_job("b")];
        assert_eq!(scale_plan(2, &jobs).unwrap(), ScalePlan::Hold);
    }

    #[test]
    fn scale_down_prefers_completed_instances() {
        let jobs = vec![
            bare_job("running-1"),
            completed_at("done-1", "2025-06-01T11:59:00+00:00"),
            bare_job("running-2"),
            completed_at("done-2", "2025-06-01T11:59:30+00:00"),
        ];
        // Quota of 2 with exactly 2 completed: no running instance is touched.
        match scale_plan(2, &jobs).unwrap() {
            ScalePlan::Shrink(names) => assert_eq!(names, vec!["done-1", "done-2"]),
            other => panic!("expected shrink, got {:?}", other),
        }
    }

    #[test]
    fn scale_down_falls_back_to_running_in_list_order() {
        let jobs = vec![
            bare_job("running-1"),
            completed_at("done-1", "2025-06-01T11:59:00+00:00"),
            bare_job("running-2"),
        ];
        match scale_plan(0, &jobs).unwrap() {
            ScalePlan::Shrink(names) => {
                assert_eq!(names, vec!["done-1", "running-1", "running-2"])
            }
            other => panic!("expected shrink, got {:?}", other),
        }
    }

    #[test]
    fn aggregate_classifies_heterogeneous_fleet() {
        let jobs = vec![
            bare_job("no-status"),
            job("active", json!({ "replicaStatuses": { "Master": { "active": 1 } } })),
            job("failed", json!({ "replicaStatuses": { "Master": { "failed": 1 } } })),
            job("succeeded", json!({ "replicaStatuses": { "Master": { "succeeded": 1 } } })),
        ];
        let tally = aggregate(&jobs).unwrap();
        assert_eq!(tally.total, 4);
        assert_eq!(tally.running, 1);
        assert_eq!(tally.failed, 1);
        assert_eq!(tally.pending, 2);
    }

    #[test]
    fn aggregate_active_wins_over_failed_within_one_job() {
        let jobs = vec![job(
            "flapping",
            json!({ "replicaStatuses": { "Master": { "active": 1, "failed": 2 } } }),
        )];
        let tally = aggregate(&jobs).unwrap();
        assert_eq!(tally.running, 1);
        assert_eq!(tally.failed, 0);
    }
}
