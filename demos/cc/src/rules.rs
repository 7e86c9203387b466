//! C library and binary targets.

use std::sync::Arc;

use dbt_graph::{
    BuildContext, BuildPath, BuildStep, Buildable, Error, OutputPath, Pool, Roots, Rule,
    Runnable, SourcePath, Step, Target, path::PathError, target::shell_args,
};
use tracing::debug;

/// The compiler rule of the current profile, shared by every object file.
fn compile_rule(ctx: &mut BuildContext) -> Result<Arc<Rule>, Error> {
    let cc = ctx.flag_string("cc")?;
    let opt = ctx.flag_string("opt")?;
    let name = format!("cc_{opt}");
    if let Some(rule) = ctx.compdb_rule(&name) {
        return Ok(rule);
    }
    let cflags = match opt.as_str() {
        "release" => "-O2 -DNDEBUG",
        _ => "-O0 -g",
    };
    debug!(rule = %name, "declaring compiler rule");
    ctx.register_compdb_rule(
        Rule::new(name)
            .var("command", format!("{cc} {cflags} -MD -MF $out.d -c $in -o $out"))
            .var("description", "CC $out")
            .var("depfile", "$out.d")
            .var("deps", "gcc"),
    )
}

/// Compile each source into an object file next to it in the output tree.
fn compile(ctx: &mut BuildContext, sources: &[SourcePath]) -> Result<Vec<OutputPath>, Error> {
    let rule = compile_rule(ctx)?;
    let mut objects = Vec::with_capacity(sources.len());
    for source in sources {
        let object = source.with_extension("o")?;
        let step = BuildStep::new(Arc::clone(&rule))
            .input(source)
            .output(object.clone());
        ctx.with_trace(source.relative(), |ctx| ctx.add_step_with_rule(step))?;
        objects.push(object);
    }
    Ok(objects)
}

fn sources(roots: &Arc<Roots>, dir: &str, files: &[&str]) -> Result<Vec<SourcePath>, PathError> {
    files
        .iter()
        .map(|f| roots.src(format!("{dir}/{f}")))
        .collect()
}

/// A static library.
pub struct CcLibrary {
    sources: Vec<SourcePath>,
    archive: OutputPath,
}

impl CcLibrary {
    pub fn new(
        roots: &Arc<Roots>,
        dir: &str,
        name: &str,
        files: &[&str],
    ) -> Result<Self, PathError> {
        Ok(Self {
            sources: sources(roots, dir, files)?,
            archive: roots.out(format!("{dir}/lib{name}.a"))?,
        })
    }

    pub fn archive(&self) -> &OutputPath {
        &self.archive
    }
}

impl Target for CcLibrary {
    fn description(&self) -> &str {
        "C static library"
    }

    fn as_buildable(&self) -> Option<&dyn Buildable> {
        Some(self)
    }
}

impl Buildable for CcLibrary {
    fn build(&self, ctx: &mut BuildContext) -> Result<(), Error> {
        let objects = compile(ctx, &self.sources)?;
        ctx.add_step(Step {
            outputs: vec![self.archive.clone()],
            inputs: objects.into_iter().map(BuildPath::from).collect(),
            command: "ar rcs $out $in".into(),
            description: format!("AR {}", self.archive.relative()),
            ..Default::default()
        })
    }
}

/// An executable linked against static libraries.
pub struct CcBinary {
    sources: Vec<SourcePath>,
    libraries: Vec<Arc<CcLibrary>>,
    executable: OutputPath,
}

impl CcBinary {
    pub fn new(
        roots: &Arc<Roots>,
        dir: &str,
        name: &str,
        files: &[&str],
        libraries: Vec<Arc<CcLibrary>>,
    ) -> Result<Self, PathError> {
        Ok(Self {
            sources: sources(roots, dir, files)?,
            libraries,
            executable: roots.out(format!("{dir}/{name}"))?,
        })
    }
}

impl Target for CcBinary {
    fn description(&self) -> &str {
        "C executable"
    }

    fn as_buildable(&self) -> Option<&dyn Buildable> {
        Some(self)
    }

    fn as_runnable(&self) -> Option<&dyn Runnable> {
        Some(self)
    }
}

impl Buildable for CcBinary {
    fn build(&self, ctx: &mut BuildContext) -> Result<(), Error> {
        let mut inputs: Vec<BuildPath> = compile(ctx, &self.sources)?
            .into_iter()
            .map(BuildPath::from)
            .collect();
        for library in &self.libraries {
            ctx.build_child(&**library)?;
            inputs.push(library.archive().into());
        }

        let jobs = ctx.flag_int("link-jobs")?;
        let depth = u32::try_from(jobs)
            .ok()
            .filter(|&d| d > 0)
            .ok_or_else(|| ctx.fail(format!("link-jobs must be positive, got {jobs}")))?;
        ctx.register_pool(Pool::new("link", depth))?;

        let cc = ctx.flag_string("cc")?;
        ctx.add_step(Step {
            outputs: vec![self.executable.clone()],
            inputs,
            command: format!("{cc} $in -o $out"),
            description: format!("LINK {}", self.executable.relative()),
            pool: Some("link".into()),
            ..Default::default()
        })
    }
}

impl Runnable for CcBinary {
    fn run_command(&self, args: &[String]) -> String {
        let executable = self.executable.to_string();
        if args.is_empty() {
            executable
        } else {
            format!("{executable} {}", shell_args(args))
        }
    }

    fn run_deps(&self) -> Vec<BuildPath> {
        vec![self.executable.clone().into()]
    }
}
