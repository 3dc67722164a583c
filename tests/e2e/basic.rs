use crate::*;

#[test]
fn empty_file() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("build.ninja", "")?;
    let out = space.run_expect(&mut kiln_command(vec![]))?;
    assert_output_contains(&out, "up to date");
    Ok(())
}

#[cfg(unix)]
#[test]
fn basic_build_then_up_to_date() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[TOUCH_RULE, "build out: touch in", ""].join("\n"),
    )?;
    space.write("in", "")?;
    let out = space.run_expect(&mut kiln_command(vec!["out"]))?;
    assert_output_contains(&out, "finished 1 command");
    assert!(space.read("out").is_ok());

    // Nothing changed, so the second invocation does nothing.
    let out = space.run_expect(&mut kiln_command(vec!["out"]))?;
    assert_output_contains(&out, "up to date");

    // Touching the input reruns the step.
    space.touch("in")?;
    let out = space.run_expect(&mut kiln_command(vec!["out"]))?;
    assert_output_contains(&out, "finished 1 command");
    Ok(())
}

#[cfg(unix)]
#[test]
fn two_step_chain() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            TOUCH_RULE,
            "build mid: touch in",
            "build out: touch mid",
            "",
        ]
        .join("\n"),
    )?;
    space.write("in", "")?;
    let out = space.run_expect(&mut kiln_command(vec!["out"]))?;
    assert_output_contains(&out, "finished 2 commands");
    assert!(space.read("mid").is_ok());
    assert!(space.read("out").is_ok());
    Ok(())
}

#[cfg(unix)]
#[test]
fn create_subdir() -> anyhow::Result<()> {
    // A build rule whose output lives in a directory that doesn't exist yet.
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[TOUCH_RULE, "build subdir/out: touch in", ""].join("\n"),
    )?;
    space.write("in", "")?;
    space.run_expect(&mut kiln_command(vec!["subdir/out"]))?;
    assert!(space.read("subdir/out").is_ok());
    Ok(())
}

#[cfg(unix)]
#[test]
fn command_change_rebuilds() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let manifest = |flag: &str| {
        format!(
            "rule write\n  command = echo {} > $out\nbuild out: write in\n",
            flag
        )
    };
    space.write("build.ninja", &manifest("one"))?;
    space.write("in", "")?;
    space.run_expect(&mut kiln_command(vec!["out"]))?;

    // Same files, different command: must rerun.
    space.write("build.ninja", &manifest("two"))?;
    let out = space.run_expect(&mut kiln_command(vec!["out"]))?;
    assert_output_contains(&out, "finished 1 command");
    assert_eq!(space.read("out")?, b"two\n");
    Ok(())
}

#[cfg(unix)]
#[test]
fn failing_command_reports_failure() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "rule bad\n  command = echo oh no && exit 1\nbuild out: bad in\n",
    )?;
    space.write("in", "")?;
    let out = space.run(&mut kiln_command(vec!["out"]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "FAILED:");
    assert_output_contains(&out, "oh no");
    assert_output_contains(&out, "subcommand failed");
    Ok(())
}

#[cfg(unix)]
#[test]
fn unknown_target_is_an_error() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("build.ninja", &[TOUCH_RULE, ""].join("\n"))?;
    let out = space.run(&mut kiln_command(vec!["mystery"]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "unknown target 'mystery'");
    Ok(())
}

#[cfg(unix)]
#[test]
fn default_targets_and_roots() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            TOUCH_RULE,
            "build a: touch in",
            "build b: touch in",
            "default a",
            "",
        ]
        .join("\n"),
    )?;
    space.write("in", "")?;
    space.run_expect(&mut kiln_command(vec![]))?;
    assert!(space.read("a").is_ok());
    assert!(space.read("b").is_err());

    // Without a default everything at the roots gets built.
    space.write(
        "build.ninja",
        &[TOUCH_RULE, "build a: touch in", "build b: touch in", ""].join("\n"),
    )?;
    space.run_expect(&mut kiln_command(vec![]))?;
    assert!(space.read("b").is_ok());
    Ok(())
}

#[cfg(unix)]
#[test]
fn parallel_build() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            TOUCH_RULE,
            "build a: touch in",
            "build b: touch in",
            "build c: touch in",
            "build all: phony a b c",
            "",
        ]
        .join("\n"),
    )?;
    space.write("in", "")?;
    let out = space.run_expect(&mut kiln_command(vec!["-j", "3", "all"]))?;
    assert_output_contains(&out, "finished 3 commands");
    Ok(())
}

#[cfg(unix)]
#[test]
fn generate_rsp_file() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "
rule cat
  command = cat ${out}.rsp > ${out}
  rspfile = ${out}.rsp
  rspfile_content = 1 $in 2 $in_newline 3

build main: cat foo bar

rule touch
  command = touch $out

build foo: touch
build bar: touch
",
    )?;
    space.run_expect(&mut kiln_command(vec!["main"]))?;

    // The command copied its rsp file into the output, and the rsp file was
    // cleaned up afterwards.
    assert_eq!(space.read("main")?, b"1 foo bar 2 foo\nbar 3");
    assert!(space.read("main.rsp").is_err());
    Ok(())
}

#[cfg(unix)]
#[test]
fn restat_stops_rebuild_cascade() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "
rule maybe_write
  command = if ! cmp -s content $out; then cp content $out; fi
  restat = 1

rule touch
  command = touch $out
  description = touch $out

build mid: maybe_write content
build out: touch mid
",
    )?;
    space.write("content", "v1")?;
    let out = space.run_expect(&mut kiln_command(vec!["out"]))?;
    assert_output_contains(&out, "finished 2 commands");

    // Touch the source without changing it: the restat rule runs, sees an
    // unchanged mid, and out is left alone.
    space.touch("content")?;
    let out = space.run_expect(&mut kiln_command(vec!["out"]))?;
    assert_output_contains(&out, "finished 1 command");
    assert_output_not_contains(&out, "touch out");
    Ok(())
}

#[cfg(unix)]
#[test]
fn dry_run_runs_nothing() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[TOUCH_RULE, "build out: touch in", ""].join("\n"),
    )?;
    space.write("in", "")?;
    let out = space.run_expect(&mut kiln_command(vec!["-n", "out"]))?;
    assert_output_contains(&out, "finished 1 command");
    assert!(space.read("out").is_err());
    Ok(())
}
