//! Post-install scripts and environment setup templates shipped under `osg/`.
//!
//! The templates carry an `@@OSG_LOCATION@@` placeholder that
//! `osg-post-install` fills in once the tarball has been unpacked.

use anyhow::anyhow;
use log::debug;
use std::path::Path;

use crate::error::{BuildError, FsContext, Result};
use crate::runtime::Runtime;

pub const SCRIPTS_DEST_DIR: &str = "osg";
pub const POST_SCRIPTS: [&str; 2] = ["osg-post-install", "osgrun.in"];
pub const LOCATION_PLACEHOLDER: &str = "@@OSG_LOCATION@@";

/// Copy the post-install scripts into `<stage>/osg` and render the setup templates.
#[tracing::instrument(skip(runtime))]
pub fn copy_post_scripts<R: Runtime>(
    runtime: &R,
    stage_dir: &Path,
    post_scripts_dir: &Path,
    dver: &str,
    basearch: &str,
) -> Result<()> {
    if !runtime.is_dir(post_scripts_dir) {
        return Err(BuildError::filesystem(
            format!("script directory ({:?}) not found", post_scripts_dir),
            anyhow!("not a directory"),
        ));
    }

    let dest_dir = stage_dir.join(SCRIPTS_DEST_DIR);
    runtime
        .create_dir_all(&dest_dir)
        .fs_context(|| format!("unable to create {:?}", dest_dir))?;

    for name in POST_SCRIPTS {
        let src = post_scripts_dir.join(name);
        let dest = dest_dir.join(name);
        let context = || format!("unable to copy script ({:?}) to ({:?})", src, dest_dir);
        runtime.copy(&src, &dest).fs_context(context)?;
        runtime.set_permissions(&dest, 0o755).fs_context(context)?;
        debug!("copied {:?} -> {:?}", src, dest);
    }

    write_setup_templates(runtime, &dest_dir, dver, basearch).fs_context(|| {
        "unable to create environment script templates (setup.csh.in, setup.sh.in)"
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shell {
    Sh,
    Csh,
}

impl Shell {
    pub fn template_name(self) -> &'static str {
        match self {
            Shell::Sh => "setup.sh.in",
            Shell::Csh => "setup.csh.in",
        }
    }
}

pub fn write_setup_templates<R: Runtime>(
    runtime: &R,
    dest_dir: &Path,
    dver: &str,
    basearch: &str,
) -> anyhow::Result<()> {
    for shell in [Shell::Sh, Shell::Csh] {
        let path = dest_dir.join(shell.template_name());
        runtime.write(&path, render_setup(shell, dver, basearch).as_bytes())?;
    }
    Ok(())
}

fn is_64bit(basearch: &str) -> bool {
    matches!(basearch, "x86_64" | "aarch64" | "ppc64le" | "ppc64" | "s390x")
}

fn python_version(dver: &str) -> Option<&'static str> {
    match dver {
        "el6" => Some("2.6"),
        "el7" => Some("2.7"),
        "el8" => Some("3.6"),
        "el9" => Some("3.9"),
        _ => None,
    }
}

fn lib_dirs(basearch: &str) -> Vec<&'static str> {
    if is_64bit(basearch) {
        vec!["lib64", "usr/lib64", "lib", "usr/lib"]
    } else {
        vec!["lib", "usr/lib"]
    }
}

/// Render the environment setup template for one shell.
pub fn render_setup(shell: Shell, dver: &str, basearch: &str) -> String {
    let under_location = |dirs: &[String]| -> String {
        dirs.iter()
            .map(|d| format!("$OSG_LOCATION/{}", d))
            .collect::<Vec<_>>()
            .join(":")
    };
    let libs: Vec<String> = lib_dirs(basearch).into_iter().map(String::from).collect();
    let lib = if is_64bit(basearch) { "lib64" } else { "lib" };
    let perl = vec![
        "usr/share/perl5/vendor_perl".to_string(),
        "usr/share/perl5".to_string(),
        format!("usr/{}/perl5/vendor_perl", lib),
        format!("usr/{}/perl5", lib),
    ];

    let mut out = format!(
        "# Environment for the OSG client tarball ({} {})\n",
        dver, basearch
    );
    set_var(&mut out, shell, "OSG_LOCATION", LOCATION_PLACEHOLDER);
    set_var(&mut out, shell, "GLOBUS_LOCATION", "$OSG_LOCATION/usr");
    prepend_var(
        &mut out,
        shell,
        "PATH",
        &under_location(&["usr/bin", "usr/sbin", "bin", "sbin"].map(String::from)),
    );
    prepend_var(&mut out, shell, "LD_LIBRARY_PATH", &under_location(&libs));
    prepend_var(&mut out, shell, "PERL5LIB", &under_location(&perl));
    if let Some(py) = python_version(dver) {
        let site = vec![
            format!("usr/{}/python{}/site-packages", lib, py),
            format!("usr/lib/python{}/site-packages", py),
        ];
        prepend_var(&mut out, shell, "PYTHONPATH", &under_location(&site));
    }
    prepend_var(
        &mut out,
        shell,
        "MANPATH",
        &under_location(&["usr/share/man".to_string()]),
    );
    default_var(
        &mut out,
        shell,
        "X509_CERT_DIR",
        "$OSG_LOCATION/etc/grid-security/certificates",
    );
    out
}

fn set_var(out: &mut String, shell: Shell, name: &str, value: &str) {
    out.push_str(&match shell {
        Shell::Sh => format!("{name}=\"{value}\"\nexport {name}\n"),
        Shell::Csh => format!("setenv {name} \"{value}\"\n"),
    });
}

fn prepend_var(out: &mut String, shell: Shell, name: &str, value: &str) {
    out.push_str(&match shell {
        Shell::Sh => format!("{name}=\"{value}${{{name}:+:${name}}}\"\nexport {name}\n"),
        Shell::Csh => format!(
            "if ($?{name}) then\n    setenv {name} \"{value}:${{{name}}}\"\nelse\n    setenv {name} \"{value}\"\nendif\n"
        ),
    });
}

fn default_var(out: &mut String, shell: Shell, name: &str, value: &str) {
    out.push_str(&match shell {
        Shell::Sh => format!("{name}=\"${{{name}:-{value}}}\"\nexport {name}\n"),
        Shell::Csh => format!("if (! $?{name}) setenv {name} \"{value}\"\n"),
    });
}
