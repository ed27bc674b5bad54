use clap::Parser;
use log::error;
use osg_stage2::BuildFile;
use osg_stage2::Stage2Builder;
use osg_stage2::installer::YumInstaller;
use osg_stage2::process::SystemCommandRunner;
use osg_stage2::runtime::{RealRuntime, Runtime};
use std::path::PathBuf;
use std::process::ExitCode;

/// osg-stage2 - OSG stage 2 tarball builder
///
/// Installs packages into a stage 1 root, patches and relocates them, and
/// packs everything stage 1 did not already ship into a tarball.
///
/// Must run as root: packages are installed with yum --installroot and /proc
/// is mounted inside the staging root during the install.
///
/// Exit status is 0 on success, 1 when the build failed and 2 on usage or
/// internal errors.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log debug output
    #[arg(long, short = 'v', global = true)]
    verbose: bool,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Build a stage 2 tarball
    Build(BuildArgs),
}

#[derive(clap::Args, Debug, Default)]
pub struct BuildArgs {
    /// Staging directory holding the stage 1 root (also via OSG_STAGE_DIR)
    #[arg(long, env = "OSG_STAGE_DIR", value_name = "DIR")]
    pub stage_dir: Option<PathBuf>,

    /// Path of the tarball to create
    #[arg(long, value_name = "FILE")]
    pub tarball: Option<PathBuf>,

    /// Package or @group to install (repeatable)
    #[arg(long = "package", short = 'p', value_name = "NAME")]
    pub packages: Vec<String>,

    /// Directory of *.patch files to apply (repeatable)
    #[arg(long = "patch-dir", value_name = "DIR")]
    pub patch_dirs: Vec<PathBuf>,

    /// Directory holding osg-post-install and osgrun.in
    #[arg(long, value_name = "DIR")]
    pub post_scripts_dir: Option<PathBuf>,

    /// Yum repo definitions to install from
    #[arg(long, value_name = "FILE")]
    pub repofile: Option<PathBuf>,

    /// Distro version, e.g. el7
    #[arg(long)]
    pub dver: Option<String>,

    /// Base architecture, e.g. x86_64
    #[arg(long)]
    pub basearch: Option<String>,

    /// Release number for the version string [default: 0]
    #[arg(long)]
    pub relnum: Option<u32>,

    /// Additional repo to enable (repeatable)
    #[arg(long = "extra-repo", value_name = "REPO")]
    pub extra_repos: Vec<String>,

    /// JSON build file; command line values override it
    #[arg(long = "config", short = 'c', value_name = "FILE")]
    pub config: Option<PathBuf>,
}

impl BuildArgs {
    fn into_build_file(self) -> (Option<PathBuf>, BuildFile) {
        let file = BuildFile {
            stage_dir: self.stage_dir,
            packages: self.packages,
            tarball: self.tarball,
            patch_dirs: self.patch_dirs,
            post_scripts_dir: self.post_scripts_dir,
            repofile: self.repofile,
            dver: self.dver,
            basearch: self.basearch,
            relnum: self.relnum,
            extra_repos: self.extra_repos,
        };
        (self.config, file)
    }
}

fn build(args: BuildArgs) -> anyhow::Result<bool> {
    let runtime = RealRuntime;
    let (config, cli_file) = args.into_build_file();
    let file = match config {
        Some(path) => BuildFile::load(&runtime, &path)?.merge(cli_file),
        None => cli_file,
    };
    let opts = file.into_options(&runtime.current_dir()?)?;

    let runner = SystemCommandRunner;
    let installer = YumInstaller::new(&RealRuntime, &SystemCommandRunner);
    let builder = Stage2Builder::new(runtime, runner, installer);
    Ok(builder.make_stage2_tarball(&opts)?)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    let result = match cli.command {
        Commands::Build(args) => build(args),
    };
    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(2)
        }
    }
}
