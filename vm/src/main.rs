use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::process;

use clap::{Parser as ClapParser, Subcommand};

use t3vm::{ErrorMessages, ExitStatus, PoolMode, StdHost, VM, VMCreateInfo};

#[derive(ClapParser, Debug)]
#[command(author, version, about = "Run T3 image files", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load an image and run its entrypoint
    Run {
        #[arg(help = "The .t3 image to run")]
        image: String,

        #[arg(long, help = "Load pool pages on demand instead of up front")]
        paged: bool,

        #[arg(long, default_value_t = 64, help = "Resident page limit per pool when paged")]
        max_pages: usize,

        #[arg(long, help = "Size of the object id namespace")]
        max_objects: Option<u32>,

        #[arg(long, help = "Restore this saved state before running")]
        restore: Option<String>,

        #[arg(long, help = "Save the final state to this file")]
        save: Option<String>,

        #[arg(long, help = "File of number=template error message overrides")]
        messages: Option<String>,

        #[arg(trailing_var_arg = true, help = "Arguments passed to the program")]
        args: Vec<String>,
    },
    /// Print an image's blocks and dependency tables
    Info {
        #[arg(help = "The .t3 image to describe")]
        image: String,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let code = match cli.command {
        Command::Run {
            image,
            paged,
            max_pages,
            max_objects,
            restore,
            save,
            messages,
            args,
        } => {
            let mut info = VMCreateInfo {
                args,
                ..Default::default()
            };
            if paged {
                info.pool_mode = PoolMode::Paged {
                    max_resident_pages: max_pages,
                };
            }
            if let Some(n) = max_objects {
                info.heap.max_objects = n;
            }
            if let Some(path) = messages {
                match fs::read_to_string(&path) {
                    Ok(text) => info.messages = ErrorMessages::parse(&text),
                    Err(e) => fail(&format!("{path}: {e}")),
                }
            }
            run(&image, info, restore.as_deref(), save.as_deref())
        }
        Command::Info { image } => {
            describe(&image);
            0
        }
    };
    process::exit(code);
}

fn fail(message: &str) -> ! {
    eprintln!("error: {message}");
    process::exit(1);
}

fn load(path: &str, info: VMCreateInfo) -> VM {
    let file = File::open(path).unwrap_or_else(|e| fail(&format!("{path}: {e}")));
    VM::load_image(BufReader::new(file), info, Box::new(StdHost::new()))
        .unwrap_or_else(|e| fail(&format!("{path}: {e}")))
}

fn run(image: &str, info: VMCreateInfo, restore: Option<&str>, save: Option<&str>) -> i32 {
    let mut vm = load(image, info);

    if let Some(path) = restore {
        let mut file = File::open(path).unwrap_or_else(|e| fail(&format!("{path}: {e}")));
        if let Err(e) = vm.restore_state(&mut file) {
            fail(&format!("{path}: {}", vm.format_error(&e)));
        }
    }

    // Errors that end the run were already reported through the host.
    let code = match vm.run() {
        Ok(ExitStatus::Completed(_)) | Ok(ExitStatus::Quit) => 0,
        Ok(ExitStatus::Aborted) => 2,
        Err(_) => 1,
    };

    if let Some(path) = save {
        let file = File::create(path).unwrap_or_else(|e| fail(&format!("{path}: {e}")));
        if let Err(e) = vm.save_state(&mut BufWriter::new(file)) {
            fail(&format!("{path}: {}", vm.format_error(&e)));
        }
    }
    code
}

fn describe(image: &str) {
    let vm = load(image, VMCreateInfo::default());
    let info = vm.image_info();

    let identity: String = info.identity.iter().map(|b| format!("{b:02x}")).collect();
    println!("image format {}", info.version);
    println!("identity     {identity}");
    println!("objects      {}", info.object_count);

    println!("\nblocks:");
    for block in &info.blocks {
        let flag = if block.mandatory { "mandatory" } else { "optional" };
        println!("  {} at {:>8}  {:>8} bytes  {flag}", block.tag, block.offset, block.size);
    }

    println!("\nmetaclasses:");
    for (i, m) in vm.metaclasses().iter().enumerate() {
        println!(
            "  {i:>3} {:<12} requested {}  {} method props",
            m.name(),
            m.requested,
            m.props.len()
        );
    }

    println!("\nfunction sets:");
    for (i, f) in vm.function_sets().iter().enumerate() {
        println!(
            "  {i:>3} {:<12} requested {}  using {}  {} functions",
            f.desc.name, f.requested, f.selected, f.exposed
        );
    }
}
