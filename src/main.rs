use clap::{crate_version, value_parser, Arg, ArgAction, Command};
use hellofs::{check_option_conflicts, HelloFs, MountOption, Namespace, Session};
use log::{error, info};
use nix::unistd::{getgid, getuid};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::SystemTime;

fn main() -> ExitCode {
    let matches = Command::new("hellofs")
        .version(crate_version!())
        .about("Mount a read-only filesystem holding a single greeting")
        .arg(
            Arg::new("MOUNT_POINT")
                .required(true)
                .index(1)
                .help("Mount the filesystem at the given path"),
        )
        .arg(
            Arg::new("auto_unmount")
                .long("auto_unmount")
                .action(ArgAction::SetTrue)
                .help("Automatically unmount on process exit"),
        )
        .arg(
            Arg::new("allow-root")
                .long("allow-root")
                .action(ArgAction::SetTrue)
                .conflicts_with("allow-other")
                .help("Allow root user to access filesystem"),
        )
        .arg(
            Arg::new("allow-other")
                .long("allow-other")
                .action(ArgAction::SetTrue)
                .help("Allow all users to access filesystem"),
        )
        .arg(
            Arg::new("workers")
                .long("workers")
                .value_parser(value_parser!(usize))
                .default_value("1")
                .help("Number of threads serving requests"),
        )
        .get_matches();
    env_logger::init();

    let Some(mountpoint) = matches.get_one::<String>("MOUNT_POINT") else {
        error!("missing MOUNT_POINT");
        return ExitCode::FAILURE;
    };
    let mut options = vec![MountOption::RO, MountOption::FSName("hello".to_string())];
    if matches.get_flag("auto_unmount") {
        options.push(MountOption::AutoUnmount);
    }
    if matches.get_flag("allow-root") {
        options.push(MountOption::AllowRoot);
    }
    if matches.get_flag("allow-other") {
        options.push(MountOption::AllowOther);
    }
    let workers = matches.get_one::<usize>("workers").copied().unwrap_or(1);

    let namespace = Namespace::hello()
        .with_owner(getuid().as_raw(), getgid().as_raw())
        .with_timestamp(SystemTime::now());
    let fs = HelloFs::new(Arc::new(namespace));

    let result = check_option_conflicts(&options)
        .and_then(|()| Session::new(fs, mountpoint, &options))
        .and_then(|mut session| {
            session.set_workers(workers);
            session.run()
        });
    match result {
        Ok(()) => {
            info!("{mountpoint} unmounted");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("hellofs on {mountpoint}: {err}");
            eprintln!("hellofs: {err}");
            ExitCode::FAILURE
        }
    }
}
