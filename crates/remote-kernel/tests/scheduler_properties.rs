//! Launch command properties across the scheduler adapters.

use proptest::prelude::*;
use remote_kernel::scanner::ReadyMarker;
use remote_kernel::{Interface, ResourceRequest, Scheduler};

fn arb_request() -> impl Strategy<Value = ResourceRequest> {
    (
        1u32..=64,
        proptest::option::of("[1-9][0-9]{0,2}[MG]"),
        proptest::option::of("[0-9]{1,2}:[0-5][0-9]:[0-5][0-9]"),
        "[a-z]{2,6}",
    )
        .prop_map(|(cpus, mem, time, pe)| ResourceRequest {
            cpus,
            mem,
            time,
            pe,
            launch_args: None,
        })
}

fn command(interface: Interface, request: &ResourceRequest) -> String {
    Scheduler::new(interface, Some("login1"))
        .expect("scheduler")
        .build_launch_command(request)
        .expect("command")
        .render()
}

proptest! {
    #[test]
    fn pbs_flags_follow_request(request in arb_request()) {
        let line = command(Interface::Pbs, &request);
        prop_assert_eq!(line.contains("ncpus="), request.cpus > 1);
        prop_assert_eq!(line.contains("mem="), request.mem.is_some());
        prop_assert_eq!(line.contains("walltime="), request.time.is_some());
        let any = request.cpus > 1 || request.mem.is_some() || request.time.is_some();
        prop_assert_eq!(line.contains(" -l "), any);
        prop_assert!(line.starts_with("qsub -I"));
        prop_assert!(line.ends_with("-N ikernel_remote"));
    }

    #[test]
    fn sge_flags_follow_request(request in arb_request()) {
        let line = command(Interface::Sge, &request);
        prop_assert_eq!(line.contains(" -pe "), request.cpus > 1);
        if request.cpus > 1 {
            let expected = format!("-pe {} {}", request.pe, request.cpus);
            prop_assert!(line.contains(&expected));
        }
        prop_assert_eq!(line.contains("h_vmem="), request.mem.is_some());
        prop_assert_eq!(line.contains("h_rt="), request.time.is_some());
        prop_assert!(line.starts_with("qlogin -now n"));
    }

    #[test]
    fn slurm_flags_follow_request(request in arb_request()) {
        let line = command(Interface::Slurm, &request);
        prop_assert_eq!(line.contains("--cpus-per-task"), request.cpus > 1);
        prop_assert_eq!(line.contains("--mem"), request.mem.is_some());
        prop_assert_eq!(line.contains("--time"), request.time.is_some());
        prop_assert!(line.ends_with("-J ikernel_remote -v -u bash -i"));
    }

    #[test]
    fn local_and_ssh_ignore_resources(request in arb_request()) {
        let default = ResourceRequest::default();
        for interface in [Interface::Local, Interface::Ssh] {
            prop_assert_eq!(command(interface, &request), command(interface, &default));
        }
    }

    #[test]
    fn launch_args_are_appended_verbatim(args in "-[a-z] [a-z0-9]{1,8}") {
        let request = ResourceRequest {
            launch_args: Some(args.clone()),
            ..ResourceRequest::default()
        };
        for interface in Interface::ALL {
            prop_assert!(command(interface, &request).contains(&args));
        }
    }
}

#[test]
fn default_commands() {
    let request = ResourceRequest::default();
    assert_eq!(command(Interface::Local, &request), "/bin/bash");
    assert_eq!(
        command(Interface::Ssh, &request),
        "ssh -o StrictHostKeyChecking=no login1"
    );
    assert_eq!(command(Interface::Pbs, &request), "qsub -I -N ikernel_remote");
    assert_eq!(command(Interface::Sge, &request), "qlogin -now n -N ikernel_remote");
    assert_eq!(
        command(Interface::Slurm, &request),
        "srun -J ikernel_remote -v -u bash -i"
    );
}

#[test]
fn sge_host_is_extracted() {
    let text = "Your job 1234 (\"ikernel_remote\") has been submitted\n\
                waiting for interactive job to be scheduled ...\n\
                Your interactive job 1234 has been successfully scheduled.\n\
                Establishing builtin session to host node042 ...\n";
    assert_eq!(ReadyMarker::sge().extract_host(text).as_deref(), Some("node042"));
}

#[test]
fn slurm_and_pbs_hosts_are_extracted() {
    assert_eq!(
        ReadyMarker::slurm()
            .extract_host("srun: Node cn-017, 1 tasks started\n")
            .as_deref(),
        Some("cn-017")
    );
    assert_eq!(
        ReadyMarker::pbs_job()
            .extract_host("qsub: waiting for job 991.pbs01 to start\nqsub: job 991.pbs01 ready\n")
            .as_deref(),
        Some("991.pbs01")
    );
    assert_eq!(
        ReadyMarker::pbs_host()
            .extract_host("Running on n12.cluster\n")
            .as_deref(),
        Some("n12.cluster")
    );
}
