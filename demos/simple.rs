//! Load an EXE entirely in memory and run its entry point.

use std::fs::File;
use std::io::prelude::*;

use pe_loader::Module;

const PATH: &str = "F:\\Programming\\C++\\Tmp\\Malloc\\x64\\Debug\\Malloc.exe";

fn main() {
    let mut file = File::open(PATH).expect("couldn't open file");
    let mut contents = vec![];
    file.read_to_end(&mut contents).expect("couldn't read file");

    let module = Module::load(&contents).expect("couldn't load .exe");
    let exit_code = module.call_entry().expect("couldn't call entry point");
    println!("done, exit code {exit_code}");
}
