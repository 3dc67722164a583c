//! Tests around dependencies discovered at build time (depfiles and the
//! deps log).

use crate::*;

#[cfg(unix)]
#[test]
fn depfile_deps_trigger_rebuild() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    // A fake compiler: writes the output and a depfile naming hdr.
    space.write(
        "build.ninja",
        "
rule cc
  command = echo \"$out: hdr\" > $out.d && touch $out
  deps = gcc
  depfile = $out.d

build out.o: cc in.c
",
    )?;
    space.write("in.c", "")?;
    space.write("hdr", "")?;

    let out = space.run_expect(&mut kiln_command(vec!["out.o"]))?;
    assert_output_contains(&out, "finished 1 command");
    // The depfile is consumed into the deps log.
    assert!(space.read("out.o.d").is_err());
    assert!(space.read(".ninja_deps").is_ok());

    // Unchanged: nothing to do, even without the depfile on disk.
    let out = space.run_expect(&mut kiln_command(vec!["out.o"]))?;
    assert_output_contains(&out, "up to date");

    // Touching the discovered header reruns the compile.
    space.touch("hdr")?;
    let out = space.run_expect(&mut kiln_command(vec!["out.o"]))?;
    assert_output_contains(&out, "finished 1 command");
    Ok(())
}

#[cfg(unix)]
#[test]
fn deleted_discovered_dep_rebuilds_instead_of_failing() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "
rule cc
  command = touch $out && echo \"$out: extra\" > $out.d
  deps = gcc
  depfile = $out.d

build out.o: cc in.c
",
    )?;
    space.write("in.c", "")?;
    space.write("extra", "")?;
    space.run_expect(&mut kiln_command(vec!["out.o"]))?;

    // The header going away must rebuild (the deps log gave it a phony
    // producer), not error out.
    std::fs::remove_file(space.path().join("extra"))?;
    let out = space.run_expect(&mut kiln_command(vec!["out.o"]))?;
    assert_output_contains(&out, "finished 1 command");
    Ok(())
}
