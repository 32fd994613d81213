use std::{fs, io};

const PROTO_DIR: &str = "./protos/";
const OUT_DIR: &str = "./generated/";

fn main() -> io::Result<()> {
    println!("cargo:rerun-if-changed={}", PROTO_DIR);

    fs::create_dir_all(OUT_DIR)?;
    tonic_build::configure()
        .out_dir(OUT_DIR)
        .compile(&["./protos/consensus.proto"], &[PROTO_DIR])
}
