//! A generator for a tiny C workspace: one static library and one program
//! linking against it.

use std::{process::ExitCode, sync::Arc};

use dbt_graph::{FlagSpec, FlagValue, Generator};

use crate::rules::{CcBinary, CcLibrary};

mod rules;

fn main() -> ExitCode {
    dbt_graph_cli::main(register)
}

fn register(generator: &mut Generator) -> anyhow::Result<()> {
    generator.declare_flag(FlagSpec::string("cc").description("C compiler").default_fn(|| {
        Some(FlagValue::from(
            std::env::var("CC").unwrap_or_else(|_| "cc".into()),
        ))
    }))?;
    generator.declare_flag(
        FlagSpec::string("opt")
            .description("optimization profile")
            .allowed(["debug", "release"])
            .default_value("debug"),
    )?;
    generator.declare_flag(
        FlagSpec::int("link-jobs")
            .description("maximum number of concurrent links")
            .default_value(2i64),
    )?;

    let roots = Arc::clone(generator.roots());
    let util = Arc::new(CcLibrary::new(
        &roots,
        "util",
        "util",
        &["strings.c", "list.c"],
    )?);
    let hello = CcBinary::new(&roots, "app", "hello", &["main.c"], vec![Arc::clone(&util)])?;
    generator.add_target("//util:Util", util)?;
    generator.add_target("//app:Hello", hello)?;
    Ok(())
}
