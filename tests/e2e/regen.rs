//! Tests for manifests that regenerate themselves.

use crate::*;

#[cfg(unix)]
#[test]
fn stale_manifest_is_regenerated_before_building() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let manifest = "
rule configure
  command = cp src.ninja $out
  generator = 1

rule touch
  command = touch $out

build build.ninja: configure src.ninja
build out: touch in
";
    space.write("src.ninja", manifest)?;
    space.write("build.ninja", manifest)?;
    space.write("in", "")?;
    // Make the source of truth newer than the manifest.
    space.touch("src.ninja")?;

    let out = space.run_expect(&mut kiln_command(vec!["out"]))?;
    assert!(space.read("out").is_ok());
    assert_output_contains(&out, "finished 1 command");

    // Once regenerated, later runs leave the manifest alone.
    let out = space.run_expect(&mut kiln_command(vec!["out"]))?;
    assert_output_contains(&out, "up to date");
    Ok(())
}
