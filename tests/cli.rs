use std::path::PathBuf;

use clap::Parser as _;
use jailshim::cli::Args;
use jailshim::config::{CloneNamespaces, Mode, Personality};

fn parse(args: &[&str]) -> Args {
    Args::parse_from(std::iter::once(&"jailshim").chain(args.iter()))
}

#[test]
fn full_flag_set_round_trips_into_config() {
    let args = parse(&[
        "-M",
        "o",
        "-c",
        "/srv/jail",
        "-u",
        "1000",
        "-g",
        "1000",
        "-H",
        "sandbox",
        "--rw",
        "-B",
        "/usr",
        "-B",
        "/lib",
        "-T",
        "/tmp",
        "-p",
        "9000",
        "-t",
        "30",
        "-i",
        "4",
        "--rlimit_as",
        "256",
        "--rlimit_nofile",
        "64",
        "--persona_addr_no_randomize",
        "--disable_clone_newnet",
        "-e",
        "--keep_caps",
        "--disable_sandbox",
        "-v",
        "--",
        "/bin/echo",
        "hi",
    ]);
    let config = args.into_config().unwrap();

    assert_eq!(config.mode, Mode::StandaloneOnce);
    assert_eq!(config.chroot, PathBuf::from("/srv/jail"));
    assert_eq!(config.hostname, "sandbox");
    assert!(config.is_root_rw);
    assert_eq!(config.bind_mounts, vec![PathBuf::from("/usr"), PathBuf::from("/lib")]);
    assert_eq!(config.tmpfs_mounts, vec![PathBuf::from("/tmp")]);
    assert_eq!(config.port, 9000);
    assert_eq!(config.tlimit, 30);
    assert_eq!(config.max_conns_per_ip, 4);
    assert!(config.personality.contains(Personality::ADDR_NO_RANDOMIZE));
    assert!(!config.namespaces.contains(CloneNamespaces::NET));
    assert!(config.keep_env);
    assert!(config.keep_caps);
    assert!(!config.apply_sandbox);
    assert!(config.verbose);
    assert_eq!(config.command, vec!["/bin/echo".to_owned(), "hi".to_owned()]);
}

#[test]
fn rejects_unknown_user_name_before_build() {
    let args = parse(&["-u", "this-user-should-not-exist-anywhere-xyz", "--", "/bin/true"]);
    assert!(args.into_config().is_err());
}

#[test]
fn bindmount_and_tmpfsmount_accept_repeated_flags_in_either_order() {
    let args = parse(&[
        "-T", "/tmp", "-B", "/usr", "-T", "/var/tmp", "-B", "/lib", "--", "/bin/true",
    ]);
    let config = args.into_config().unwrap();
    assert_eq!(config.bind_mounts, vec![PathBuf::from("/usr"), PathBuf::from("/lib")]);
    assert_eq!(
        config.tmpfs_mounts,
        vec![PathBuf::from("/tmp"), PathBuf::from("/var/tmp")]
    );
}
