use assert_cmd::Command;
use assert_cmd::cargo;
use flate2::read::GzDecoder;
use osg_stage2::installer::{PackageInstaller, RepoConfig};
use osg_stage2::process::{CommandOutput, CommandRunner, CommandSpec, SystemCommandRunner};
use osg_stage2::runtime::RealRuntime;
use osg_stage2::{BuildOptions, Result, Stage2Builder};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Read;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::{TempDir, tempdir};

/// Runs chmod and tar for real and answers everything that needs root
/// (mount, rpm, patch) from canned data.
struct FakeRunner {
    installed: Vec<String>,
    patch_exit: i32,
    calls: Arc<Mutex<Vec<CommandSpec>>>,
}

impl FakeRunner {
    fn new(installed: &[&str]) -> Self {
        Self {
            installed: installed.iter().map(|s| s.to_string()).collect(),
            patch_exit: 0,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn is_installed(&self, name: &str) -> bool {
        self.installed
            .iter()
            .any(|nvr| nvr == name || nvr.starts_with(&format!("{}-", name)))
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(cmd.clone());
        match cmd.program.as_str() {
            "tar" | "chmod" => SystemCommandRunner.run(cmd),
            "mount" | "umount" => Ok(CommandOutput::exited(0, "")),
            "patch" => Ok(CommandOutput::exited(self.patch_exit, "")),
            "rpm" if cmd.args.iter().any(|a| a == "-qa") => {
                Ok(CommandOutput::exited(0, self.installed.join("\n")))
            }
            "rpm" => {
                let name = cmd.args.last().map(String::as_str).unwrap_or_default();
                let code = if self.is_installed(name) { 0 } else { 1 };
                Ok(CommandOutput::exited(code, ""))
            }
            other => panic!("unexpected command {}", other),
        }
    }
}

/// Lays down what a yum install of osg-version, gsi-openssh and java would
/// leave behind.
struct FakeInstaller;

impl PackageInstaller for FakeInstaller {
    fn install(&self, root: &Path, _packages: &[String], _repo: &RepoConfig) -> Result<()> {
        fs::create_dir_all(root.join("etc/alternatives")).unwrap();
        fs::create_dir_all(root.join("etc/gsissh")).unwrap();
        fs::create_dir_all(root.join("etc/fetch-crl.d")).unwrap();
        fs::write(root.join("etc/gsissh/ssh_config"), "Host *\n").unwrap();
        fs::create_dir_all(root.join("usr/bin")).unwrap();
        fs::create_dir_all(root.join("usr/lib/jvm/java/bin")).unwrap();
        fs::create_dir_all(root.join("var/empty")).unwrap();
        fs::create_dir_all(root.join("var/log")).unwrap();
        fs::write(root.join("var/log/yum.log"), "installed\n").unwrap();
        fs::write(root.join("etc/osg-version"), "3.4.0\n").unwrap();
        fs::write(root.join("usr/lib/jvm/java/bin/java"), "#!/bin/sh\n").unwrap();
        symlink("/usr/lib/jvm/java/bin/java", root.join("etc/alternatives/java")).unwrap();
        symlink("/etc/alternatives/java", root.join("usr/bin/java")).unwrap();
        Ok(())
    }
}

struct Fixture {
    dir: TempDir,
    opts: BuildOptions,
}

fn fixture(patch_dirs: &[&str]) -> Fixture {
    let dir = tempdir().unwrap();
    let stage = dir.path().join("stage2");
    fs::create_dir_all(stage.join("etc")).unwrap();
    fs::write(stage.join("etc/stage1.conf"), "from stage 1\n").unwrap();
    fs::write(stage.join("stage1_rpmlist"), "bash-4.2-1\nglibc-2.17-1\n").unwrap();
    fs::write(stage.join("stage1_filelist"), "./etc/stage1.conf\n").unwrap();

    let scripts = dir.path().join("post-install");
    fs::create_dir_all(&scripts).unwrap();
    fs::write(scripts.join("osg-post-install"), "#!/bin/sh\n").unwrap();
    fs::write(scripts.join("osgrun.in"), "#!/bin/sh\n").unwrap();

    for name in patch_dirs {
        let patches = dir.path().join(name);
        fs::create_dir_all(&patches).unwrap();
        fs::write(patches.join("001-fix.patch"), "--- a\n+++ b\n").unwrap();
    }

    let opts = BuildOptions {
        stage_dir: stage,
        packages: vec!["osg-version".into(), "@base".into()],
        tarball: dir.path().join("osg-wn-client.el7.x86_64.tar.gz"),
        patch_dirs: patch_dirs.iter().map(|n| dir.path().join(n)).collect(),
        post_scripts_dir: scripts,
        repo: RepoConfig {
            repofile: dir.path().join("osg.repo"),
            dver: "el7".into(),
            basearch: "x86_64".into(),
            extra_repos: vec![],
        },
        relnum: 0,
    };
    Fixture { dir, opts }
}

struct Entry {
    kind: tar::EntryType,
    link: Option<PathBuf>,
    content: String,
}

fn entries(tarball: &Path) -> BTreeMap<PathBuf, Entry> {
    let mut archive = tar::Archive::new(GzDecoder::new(File::open(tarball).unwrap()));
    archive
        .entries()
        .unwrap()
        .map(|e| {
            let mut e = e.unwrap();
            let path = e.path().unwrap().components().collect::<PathBuf>();
            let link = e.link_name().unwrap().map(|l| l.into_owned());
            let mut content = String::new();
            if e.header().entry_type().is_file() {
                e.read_to_string(&mut content).unwrap();
            }
            let kind = e.header().entry_type();
            (path, Entry { kind, link, content })
        })
        .collect()
}

#[test_log::test]
fn test_end_to_end_build() {
    let fx = fixture(&["patches"]);
    let runner = FakeRunner::new(&["bash-4.2-1", "glibc-2.17-1", "osg-version-3.4.0-1"]);
    let builder = Stage2Builder::new(RealRuntime, runner, FakeInstaller);

    assert!(builder.make_stage2_tarball(&fx.opts).unwrap());

    let tar = entries(&fx.opts.tarball);
    let get = |p: &str| tar.get(Path::new(p));

    assert_eq!(get("stage2/osg/rpm-versions.txt").unwrap().content, "osg-version-3.4.0-1\n");
    assert_eq!(get("stage2/etc/osg-version").unwrap().content, "3.4.0-tarball\n");
    assert!(get("stage2/osg/osg-post-install").is_some());
    assert!(get("stage2/osg/setup.sh.in").is_some());
    assert!(get("stage2/osg/setup.csh.in").is_some());

    let java = get("stage2/usr/bin/java").unwrap();
    assert_eq!(java.kind, tar::EntryType::Symlink);
    assert_eq!(java.link, Some(PathBuf::from("../lib/jvm/java/bin/java")));

    // stage 1 content, bookkeeping and logs stay out
    assert!(get("stage2/etc/stage1.conf").is_none());
    assert!(get("stage2/stage1_rpmlist").is_none());
    assert!(get("stage2/etc/alternatives").is_none());
    assert!(get("stage2/var/log/yum.log").is_none());

    // empty dirs pruned, required ones recreated
    assert!(get("stage2/var/empty").is_none());
    assert!(get("stage2/var/lib/osg-ca-certs").is_some());
    assert!(get("stage2/etc/fetch-crl.d").is_none());

    // gsi-openssh is not installed
    assert!(get("stage2/usr/etc/ssh").is_none());

    assert!(!fx.dir.path().join("exclude_list").exists());
}

#[test_log::test]
fn test_build_with_gsissh_and_fetch_crl() {
    let fx = fixture(&[]);
    let runner = FakeRunner::new(&[
        "bash-4.2-1",
        "fetch-crl-3.0.19-1",
        "glibc-2.17-1",
        "gsi-openssh-7.4p1-2",
        "osg-version-3.4.0-1",
    ]);
    let builder = Stage2Builder::new(RealRuntime, runner, FakeInstaller);

    assert!(builder.make_stage2_tarball(&fx.opts).unwrap());

    let tar = entries(&fx.opts.tarball);
    let get = |p: &str| tar.get(Path::new(p));

    let ssh = get("stage2/usr/etc/ssh").unwrap();
    assert_eq!(ssh.kind, tar::EntryType::Symlink);
    assert_eq!(ssh.link, Some(PathBuf::from("../../etc/gsissh")));
    assert!(get("stage2/etc/gsissh/ssh_config").is_some());

    // empty, but kept because fetch-crl is installed
    assert_eq!(get("stage2/etc/fetch-crl.d").unwrap().kind, tar::EntryType::Directory);
    assert!(get("stage2/var/lib/osg-ca-certs").is_some());

    assert_eq!(
        get("stage2/osg/rpm-versions.txt").unwrap().content,
        "fetch-crl-3.0.19-1\ngsi-openssh-7.4p1-2\nosg-version-3.4.0-1\n"
    );
}

#[test_log::test]
fn test_patch_failure_stops_build() {
    let fx = fixture(&["patches"]);
    let mut runner = FakeRunner::new(&["osg-version-3.4.0-1"]);
    runner.patch_exit = 1;
    let builder = Stage2Builder::new(RealRuntime, runner, FakeInstaller);

    assert!(!builder.make_stage2_tarball(&fx.opts).unwrap());

    assert!(!fx.opts.stage_dir.join("osg/rpm-versions.txt").exists());
    assert!(!fx.opts.tarball.exists());
}

#[test_log::test]
fn test_patch_failure_runs_no_later_commands() {
    let fx = fixture(&["patches"]);
    let mut runner = FakeRunner::new(&["osg-version-3.4.0-1"]);
    runner.patch_exit = 1;
    let log = Arc::clone(&runner.calls);
    let builder = Stage2Builder::new(RealRuntime, runner, FakeInstaller);
    assert!(!builder.make_stage2_tarball(&fx.opts).unwrap());

    let calls: Vec<String> = log.lock().unwrap().iter().map(|c| c.to_string()).collect();
    assert!(calls.iter().any(|c| c.starts_with("patch -p1 --force --fuzz=0")));
    assert!(calls.iter().all(|c| !c.contains("-qa")));
    assert!(calls.iter().all(|c| !c.starts_with("tar ")));
    assert!(calls.iter().any(|c| c.starts_with("umount ")));
}

#[test_log::test]
fn test_missing_package_fails_verification() {
    let fx = fixture(&[]);
    let runner = FakeRunner::new(&[]);
    let builder = Stage2Builder::new(RealRuntime, runner, FakeInstaller);

    assert!(!builder.make_stage2_tarball(&fx.opts).unwrap());
    assert!(!fx.opts.tarball.exists());
}

#[test]
fn test_cli_missing_stage_dir_is_usage_error() {
    let dir = tempdir().unwrap();
    Command::new(cargo::cargo_bin!("osg-stage2"))
        .current_dir(dir.path())
        .env_remove("OSG_STAGE_DIR")
        .args(["build", "--tarball", "out.tar.gz", "--dver", "el7"])
        .assert()
        .code(2)
        .stderr(predicates::str::contains("stage directory is required"));
}

#[test]
fn test_cli_unreadable_config_is_usage_error() {
    let dir = tempdir().unwrap();
    Command::new(cargo::cargo_bin!("osg-stage2"))
        .current_dir(dir.path())
        .args(["build", "--config", "missing.json"])
        .assert()
        .code(2)
        .stderr(predicates::str::contains("Failed to read build file"));
}

#[test]
fn test_cli_requires_subcommand() {
    Command::new(cargo::cargo_bin!("osg-stage2"))
        .assert()
        .failure()
        .stderr(predicates::str::contains("Usage"));
}
