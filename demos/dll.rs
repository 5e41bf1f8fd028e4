//! Load a DLL entirely in memory, let `Module::load` run `DllMain` on
//! attach, then look up and call one of its exports.

use std::fs::File;
use std::io::prelude::*;

use pe_loader::Module;

const PATH: &str = "F:\\Programming\\C++\\call\\build\\Debug\\call.dll";

type AddFn = unsafe extern "C" fn(i32, i32) -> i32;

fn main() {
    let mut file = File::open(PATH).expect("couldn't open file");
    let mut contents = vec![];
    file.read_to_end(&mut contents).expect("couldn't read file");

    let module = Module::load(&contents).expect("couldn't load .dll");
    let add: AddFn = unsafe {
        module
            .get_function_typed("Add")
            .expect("export Add not found")
    };
    let result = unsafe { add(2, 3) };
    println!("Add(2, 3) = {result}");
}
