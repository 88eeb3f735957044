//! Integration tests for the offline scheduler driven entirely through its
//! JSON wire format (`psim_scheduler::io`), the same surface `psim-cli`'s
//! `schedule` subcommand parses from stdin and serializes back out.

use std::collections::HashMap;

use psim_scheduler::io::{
    FlowProfile, JobSpec, ProfileFile, RunContextInput, SchedulerInput, SchedulerOptions,
};
use psim_scheduler::run_scheduler;

fn job_spec(job_id: i64, comm_size: f64) -> JobSpec {
    JobSpec {
        job_id,
        machines: vec![],
        layer_count: 1,
        iter_count: 2,
        comm_size,
        comp_size: 0.0,
    }
}

fn flat_profile(src: i64, dst: i64, flow_id: i64, load: f64, steps: usize) -> ProfileFile {
    ProfileFile {
        period: 20,
        flows: vec![FlowProfile {
            flow_id,
            job_id: flow_id,
            iteration: 0,
            subflow: 0,
            start_time: 0,
            end_time: steps as i64,
            srcrack: src,
            dstrack: dst,
            fct: 0.0,
            core: 0,
            label: String::new(),
            flow_size: 0.0,
            progress_history: vec![load; steps],
        }],
    }
}

// ─── Round-tripping through the JSON wire format ───────────────────────────

#[test]
fn parses_a_json_document_and_schedules_it() {
    let raw = r#"{
        "jobs": [
            {"job_id": 1, "machines": [], "layer_count": 1, "iter_count": 2, "comm_size": 10.0, "comp_size": 0.0},
            {"job_id": 2, "machines": [], "layer_count": 1, "iter_count": 2, "comm_size": 10.0, "comp_size": 0.0}
        ],
        "options": {
            "machine-count": 16,
            "ft-server-per-rack": 8,
            "link-bandwidth": 100.0,
            "ft-core-count": 2,
            "ft-agg-core-link-capacity-mult": 1.0,
            "subflows": 1
        },
        "run_context": {
            "throttle-search": false,
            "timing-scheme": "faridv6",
            "farid-rounds": 4,
            "use_inflation": false,
            "fallback-threshold": 1.0,
            "sim-length": 20
        },
        "placement_seed": 11,
        "profiles": {
            "1": {"1": {"period": 20, "flows": [
                {"flow_id": 1, "job_id": 1, "start_time": 0, "end_time": 5,
                 "srcrack": 0, "dstrack": 1, "progress_history": [90.0, 90.0, 90.0, 90.0, 90.0]}
            ]}},
            "2": {"1": {"period": 20, "flows": [
                {"flow_id": 2, "job_id": 2, "start_time": 0, "end_time": 5,
                 "srcrack": 0, "dstrack": 1, "progress_history": [90.0, 90.0, 90.0, 90.0, 90.0]}
            ]}}
        }
    }"#;

    let input: SchedulerInput = serde_json::from_str(raw).expect("the wire format should parse");
    let output = run_scheduler(input).unwrap();

    assert_eq!(output.job_timings.len(), 2);
    assert_eq!(output.add_to_context.job_costs.len(), 2);

    // The output document itself must serialize back to JSON (this is what
    // the CLI writes to stdout and to job_timings.json / lb_decisions.json).
    let serialized = serde_json::to_string(&output).unwrap();
    assert!(serialized.contains("\"job_timings\""));
    assert!(serialized.contains("\"lb_decisions\""));
}

// ─── Three jobs contending for the same rack pair converge ─────────────────

#[test]
fn three_colliding_jobs_converge_within_the_configured_round_budget() {
    let mut profiles = HashMap::new();
    for job_id in 1..=3i64 {
        let mut per_throttle = HashMap::new();
        per_throttle.insert("1".to_string(), flat_profile(0, 1, job_id, 80.0, 6));
        profiles.insert(job_id, per_throttle);
    }

    let options = SchedulerOptions {
        machine_count: 16,
        ft_server_per_rack: 8,
        link_bandwidth: 100.0,
        ft_core_count: 2,
        ft_agg_core_link_capacity_mult: 1.0,
        subflows: 1,
    };
    let run_context = RunContextInput {
        farid_rounds: 6,
        sim_length: 24,
        ..RunContextInput::default()
    };

    let input = SchedulerInput {
        jobs: vec![job_spec(1, 10.0), job_spec(2, 10.0), job_spec(3, 10.0)],
        options,
        run_context,
        timing_file_path: None,
        routing_file_path: None,
        placement_seed: 99,
        profiles,
    };

    let output = run_scheduler(input).unwrap();
    assert_eq!(output.job_timings.len(), 3);
    assert!(
        output.add_to_context.fixing_rounds <= 6,
        "should not exceed the configured fixing-round budget"
    );
    assert!(!output.lb_decisions.is_empty());
}

// ─── A job with no profile entry still gets a timing (zero load) ──────────

#[test]
fn job_without_a_profile_still_receives_a_timing() {
    let input = SchedulerInput {
        jobs: vec![job_spec(5, 1.0)],
        options: SchedulerOptions::default(),
        run_context: RunContextInput::default(),
        timing_file_path: None,
        routing_file_path: None,
        placement_seed: 0,
        profiles: HashMap::new(),
    };

    let output = run_scheduler(input).unwrap();
    assert_eq!(output.job_timings.len(), 1);
    assert_eq!(output.job_timings[0].job_id, 5);
}
