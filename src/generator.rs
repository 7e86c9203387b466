//! The generator process context, tying all components of one run together.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::{
    catalog::{Catalog, Filter},
    context::BuildContext,
    error::Error,
    flags::{FlagRegistry, FlagSources, FlagSpec, STATE_FILE_NAME},
    ninja,
    path::Roots,
    protocol::{FORMAT_VERSION, GeneratorInput, GeneratorOutput},
    target::Target,
};

/// One generator run.
///
/// Flags and targets are declared on the generator, then [`Generator::run`]
/// realizes the selected targets and produces the response document.
pub struct Generator {
    input: GeneratorInput,
    roots: Arc<Roots>,
    flags: FlagRegistry,
    catalog: Catalog,
}

impl Generator {
    pub fn new(input: GeneratorInput) -> Result<Self, Error> {
        if input.version != FORMAT_VERSION {
            return Err(Error::UnsupportedVersion {
                found: input.version,
                expected: FORMAT_VERSION,
            });
        }

        let roots = Roots::new(input.source_dir.clone(), input.output_dir.clone());
        let state_file = input.output_dir.join(STATE_FILE_NAME);
        let mut sources = FlagSources {
            command_line: input.cmdline_flags.clone(),
            workspace: input.workspace_flags.clone(),
            ..Default::default()
        };
        sources
            .load_persisted(&state_file)
            .map_err(|source| Error::Io {
                path: state_file.clone(),
                source,
            })?;

        Ok(Self {
            roots,
            flags: FlagRegistry::new(sources).with_state_file(state_file),
            catalog: Catalog::new(),
            input,
        })
    }

    pub fn input(&self) -> &GeneratorInput {
        &self.input
    }

    pub fn roots(&self) -> &Arc<Roots> {
        &self.roots
    }

    pub fn flags_mut(&mut self) -> &mut FlagRegistry {
        &mut self.flags
    }

    pub fn declare_flag(&mut self, spec: FlagSpec) -> Result<(), Error> {
        Ok(self.flags.declare(spec)?)
    }

    pub fn add_target(
        &mut self,
        path: impl Into<String>,
        target: impl Target + 'static,
    ) -> Result<(), Error> {
        Ok(self.catalog.insert(path, Box::new(target))?)
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Realize the selected targets and render the response.
    ///
    /// In completions-only mode nothing is realized and no state is written;
    /// only target and flag metadata are returned.
    pub fn run(self) -> Result<GeneratorOutput, Error> {
        let Generator {
            input,
            roots,
            mut flags,
            catalog,
        } = self;

        let filter = match Filter::new(&input.selectors) {
            Ok(filter) => filter,
            Err(e) if input.completions_only => {
                warn!("{e}; no targets selected");
                Filter::default()
            }
            Err(e) => return Err(e.into()),
        };
        let selected = catalog.select(&filter, input.mode);
        let targets = catalog.metadata(&selected);
        debug!(
            mode = ?input.mode,
            selected = selected.len(),
            total = catalog.len(),
            "selected targets"
        );

        let mut output = if input.completions_only {
            GeneratorOutput {
                targets,
                flags: flags.lock_and_export(false)?,
                selected_targets: selected,
                ..Default::default()
            }
        } else {
            let mut ctx = BuildContext::new(roots, flags)
                .with_args(input.run_args.clone(), input.test_args.clone());
            for path in &selected {
                if let Some(target) = catalog.get(path) {
                    ctx.realize(path, target)?;
                }
            }
            let (mut graph, mut flags) = ctx.finish()?;
            let defaults = selected
                .iter()
                .filter(|path| graph.target_edge(path).is_some())
                .cloned()
                .collect();
            graph.set_defaults(defaults);
            let flags = flags.lock_and_export(input.persist_flags)?;

            info!(
                steps = graph.step_count(),
                targets = selected.len(),
                "generated build file"
            );
            GeneratorOutput {
                ninja_file: ninja::render(&graph),
                targets,
                flags,
                comp_db_rules: graph.compdb_rule_names(),
                selected_targets: selected,
                dependency_graph: input.export_graph.then(|| graph.to_dot()),
                ..Default::default()
            }
        };

        if input.legacy {
            output.build_dir = Some(input.output_dir.clone());
            output.build_flags = Some(
                output
                    .flags
                    .iter()
                    .filter_map(|(name, f)| f.value.clone().map(|v| (name.clone(), v)))
                    .collect(),
            );
        }
        Ok(output)
    }
}
