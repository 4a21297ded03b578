//! 格式化磁盘映像文件

use std::process;

use clap::{value_t, App, Arg};

use xv6_bcache::consts::fs::{BSIZE, LOGSIZE, MAXOPBLOCKS};
use xv6_bcache::fs::bm_count_free;
use xv6_bcache::{FileDisk, FileSystem, FsConfig, Result, SuperBlock};

fn main() {
    let matches = App::new("mkfs")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Create an empty file system image")
        .arg(
            Arg::with_name("image")
                .help("path of the disk image to create")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::with_name("size")
                .short("s")
                .long("size")
                .takes_value(true)
                .default_value("2000")
                .help("total number of blocks"),
        )
        .arg(
            Arg::with_name("inodes")
                .short("i")
                .long("inodes")
                .takes_value(true)
                .default_value("200")
                .help("number of inodes"),
        )
        .arg(
            Arg::with_name("log")
                .short("l")
                .long("log")
                .takes_value(true)
                .default_value("30")
                .help("log region size in blocks, header included"),
        )
        .arg(
            Arg::with_name("check")
                .long("check")
                .help("mount the image after formatting and report free blocks"),
        )
        .get_matches();

    let image = matches.value_of("image").unwrap_or_default().to_string();
    let size = value_t!(matches, "size", u32).unwrap_or_else(|e| e.exit());
    let ninodes = value_t!(matches, "inodes", u32).unwrap_or_else(|e| e.exit());
    let nlog = value_t!(matches, "log", u32).unwrap_or_else(|e| e.exit());

    if let Err(e) = run(&image, size, ninodes, nlog, matches.is_present("check")) {
        eprintln!("mkfs: {}", e);
        process::exit(1);
    }
}

fn run(image: &str, size: u32, ninodes: u32, nlog: u32, check: bool) -> Result<()> {
    let sb = SuperBlock::layout(size, ninodes, nlog)?;
    let disk = FileDisk::create(image, size)?;
    FileSystem::format(&disk, &sb)?;
    println!(
        "{}: {} blocks of {} bytes, log {} (max {}), data starts at {}",
        image,
        size,
        BSIZE,
        nlog,
        LOGSIZE,
        sb.data_start()
    );

    if check {
        let config = FsConfig::default().max_op_blocks(MAXOPBLOCKS.min(nlog as usize - 1));
        let fs = FileSystem::mount(disk, config)?;
        println!("{}: {} free data blocks", image, bm_count_free(&fs)?);
    }
    Ok(())
}
