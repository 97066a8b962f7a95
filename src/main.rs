use clap::{Arg, ArgAction, Command};
use clap_num::maybe_hex;
use exhume_body::Body;
use exhume_extrecover::inode::{format_seconds, format_time, InodeSource};
use exhume_extrecover::journal::Transaction;
use exhume_extrecover::nojournal::{deleted_inodes_no_journal, recover_files_no_journal};
use exhume_extrecover::recovery::{JournalRecovery, RecoveryOutcome};
use exhume_extrecover::{ExtFS, RecoveryConfig, RecoveryError};
use log::{error, info};
use prettytable::{Cell, Row, Table};
use serde::Serialize;
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};

/// How many candidates to recover, most recently deleted first.
#[derive(Debug, Clone, Copy)]
enum RecoverCount {
    All,
    Latest(usize),
}

impl RecoverCount {
    fn take<C>(&self, candidates: &[C]) -> usize {
        match self {
            RecoverCount::All => candidates.len(),
            RecoverCount::Latest(n) => (*n).min(candidates.len()),
        }
    }
}

fn parse_count(value: &str) -> Result<RecoverCount, String> {
    if value.eq_ignore_ascii_case("all") {
        return Ok(RecoverCount::All);
    }
    match value.parse::<usize>() {
        Ok(0) | Err(_) => Err(format!("expected 'all' or a positive number, got '{}'", value)),
        Ok(n) => Ok(RecoverCount::Latest(n)),
    }
}

struct Options {
    superblock: bool,
    inode: Option<u64>,
    groupdesc: bool,
    transactions: bool,
    list: bool,
    recover: Option<RecoverCount>,
    output_dir: PathBuf,
    no_journal: bool,
    json: bool,
}

fn print_json<S: Serialize>(value: &S) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(err) => error!("Cannot serialize output: {}", err),
    }
}

fn print_table(header: &[&str], rows: Vec<Vec<String>>) {
    let mut table = Table::new();
    table.add_row(Row::new(header.iter().map(|h| Cell::new(h)).collect()));
    for row in rows {
        table.add_row(Row::new(row.iter().map(|v| Cell::new(v)).collect()));
    }
    table.printstd();
}

fn print_transactions(transactions: &[Transaction], json: bool) {
    if json {
        print_json(&transactions);
        return;
    }
    let rows = transactions
        .iter()
        .map(|tx| {
            vec![
                tx.sequence.to_string(),
                tx.descriptor_block.to_string(),
                format_seconds(tx.commit_time),
                tx.kind.to_string(),
                tx.blocks
                    .iter()
                    .map(|(block, kind)| format!("{} ({})", block, kind))
                    .collect::<Vec<_>>()
                    .join(", "),
            ]
        })
        .collect();
    print_table(
        &["Sequence", "Descriptor", "Committed", "Kind", "Logged blocks"],
        rows,
    );
}

fn print_outcomes(outcomes: &[RecoveryOutcome], json: bool) {
    if json {
        print_json(&outcomes);
        return;
    }
    let rows = outcomes
        .iter()
        .map(|outcome| match outcome {
            RecoveryOutcome::Recovered { path, bytes } => vec![
                "recovered".to_string(),
                path.display().to_string(),
                bytes.to_string(),
            ],
            RecoveryOutcome::Skipped { reason } => {
                vec!["skipped".to_string(), reason.clone(), String::new()]
            }
        })
        .collect();
    print_table(&["Outcome", "File / reason", "Bytes"], rows);
    let recovered = outcomes
        .iter()
        .filter(|o| matches!(o, RecoveryOutcome::Recovered { .. }))
        .count();
    println!("{} of {} files were recovered", recovered, outcomes.len());
}

fn ensure_dir(dir: &Path) -> bool {
    match std::fs::create_dir_all(dir) {
        Ok(()) => true,
        Err(err) => {
            error!("Cannot create output directory {}: {}", dir.display(), err);
            false
        }
    }
}

fn run_journal<T: Read + Seek>(fs: &mut ExtFS<T>, opts: &Options) -> Result<(), RecoveryError> {
    let recovery = JournalRecovery::open(fs)?;

    if opts.transactions {
        print_transactions(&recovery.transactions, opts.json);
    }

    if !opts.list && opts.recover.is_none() {
        return Ok(());
    }

    let candidates = recovery.deleted_inodes(fs);
    if opts.list {
        if opts.json {
            print_json(&candidates);
        } else {
            let rows = candidates
                .iter()
                .enumerate()
                .map(|(i, c)| {
                    vec![
                        (i + 1).to_string(),
                        c.table_block.to_string(),
                        c.slot.to_string(),
                        format_time(c.deletion_time, 0),
                        format_seconds(c.commit_time),
                        c.sequence.to_string(),
                    ]
                })
                .collect();
            print_table(
                &["#", "Table block", "Slot", "Deleted", "Committed", "Transaction"],
                rows,
            );
        }
    }

    if let Some(count) = opts.recover {
        if ensure_dir(&opts.output_dir) {
            let selected = &candidates[..count.take(&candidates)];
            let outcomes = recovery.recover_files(fs, selected, &opts.output_dir);
            print_outcomes(&outcomes, opts.json);
        }
    }
    Ok(())
}

fn run_no_journal<T: Read + Seek>(fs: &mut ExtFS<T>, opts: &Options) {
    if opts.transactions {
        info!("Filesystem has no journal to list transactions from");
    }
    if !opts.list && opts.recover.is_none() {
        return;
    }

    let candidates = deleted_inodes_no_journal(fs);
    if opts.list {
        if opts.json {
            print_json(&candidates);
        } else {
            let rows = candidates
                .iter()
                .enumerate()
                .map(|(i, c)| {
                    vec![
                        (i + 1).to_string(),
                        c.inode.to_string(),
                        format_time(c.deletion_time, 0),
                    ]
                })
                .collect();
            print_table(&["#", "Inode", "Deleted"], rows);
        }
    }

    if let Some(count) = opts.recover {
        if ensure_dir(&opts.output_dir) {
            let selected = &candidates[..count.take(&candidates)];
            let outcomes = recover_files_no_journal(fs, selected, &opts.output_dir);
            print_outcomes(&outcomes, opts.json);
        }
    }
}

fn process_partition(
    file_path: &str,
    format: &str,
    offset: u64,
    config: RecoveryConfig,
    opts: &Options,
    verbose: bool,
) {
    let mut body = Body::new_from(file_path.to_string(), format, Some(offset));
    if verbose {
        body.print_info();
    }

    let mut fs = match ExtFS::with_config(&mut body, config) {
        Ok(fs) => fs,
        Err(err) => {
            error!("ExtFS object creation error: {}", err);
            std::process::exit(1);
        }
    };
    info!("ExtFS created successfully.");

    if opts.superblock {
        if opts.json {
            print_json(&fs.superblock.to_json());
        } else {
            fs.superblock.print_sp_info();
        }
    }

    if let Some(inode_num) = opts.inode {
        match fs.inode(InodeSource::ByNumber(inode_num)) {
            Ok(inode) if opts.json => print_json(&inode.to_json()),
            Ok(inode) => println!("{}", inode.to_string()),
            Err(err) => error!("Inode {}: {}", inode_num, err),
        }
    }

    if opts.groupdesc {
        let mut descriptors = Vec::new();
        for group in 0..fs.group_count() {
            match fs.group_descriptor(group) {
                Ok(gd) => descriptors.push(gd),
                Err(err) => error!("Group {}: {}", group, err),
            }
        }
        if opts.json {
            let json_array: Vec<_> = descriptors.iter().map(|gd| gd.to_json()).collect();
            print_json(&json_array);
        } else {
            let rows = descriptors
                .iter()
                .enumerate()
                .map(|(i, gd)| {
                    vec![
                        i.to_string(),
                        gd.bg_block_bitmap.to_string(),
                        gd.bg_inode_bitmap.to_string(),
                        gd.bg_inode_table().to_string(),
                        gd.bg_free_blocks_count.to_string(),
                        gd.bg_free_inodes_count.to_string(),
                    ]
                })
                .collect();
            print_table(
                &[
                    "Group",
                    "Block bitmap",
                    "Inode bitmap",
                    "Inode table",
                    "Free blocks",
                    "Free inodes",
                ],
                rows,
            );
        }
    }

    if opts.no_journal || !fs.superblock.has_journal() {
        run_no_journal(&mut fs, opts);
    } else if let Err(err) = run_journal(&mut fs, opts) {
        error!("{}", err);
        std::process::exit(1);
    }
}

fn main() {
    let matches = Command::new("exhume_extrecover")
        .version(env!("CARGO_PKG_VERSION"))
        .author("ForensicXlab")
        .about("Recover deleted files from an extfs partition by replaying its journal.")
        .arg(
            Arg::new("body")
                .short('b')
                .long("body")
                .value_parser(clap::value_parser!(String))
                .required(true)
                .help("The path to the body to exhume."),
        )
        .arg(
            Arg::new("format")
                .short('f')
                .long("format")
                .value_parser(clap::value_parser!(String))
                .required(true)
                .help("The format of the file, either 'raw' or 'ewf'."),
        )
        .arg(
            Arg::new("offset")
                .short('o')
                .long("offset")
                .value_parser(maybe_hex::<u64>)
                .default_value("0")
                .help("The extfs partition starts at address 0x...."),
        )
        .arg(
            Arg::new("inode")
                .short('i')
                .long("inode")
                .value_parser(maybe_hex::<u64>)
                .help("Display the metadata of a specific inode number."),
        )
        .arg(
            Arg::new("superblock")
                .short('s')
                .long("superblock")
                .action(ArgAction::SetTrue)
                .help("Display the superblock information."),
        )
        .arg(
            Arg::new("groupdesc")
                .short('g')
                .long("groupdesc")
                .action(ArgAction::SetTrue)
                .help("Display the group descriptors"),
        )
        .arg(
            Arg::new("transactions")
                .short('t')
                .long("transactions")
                .action(ArgAction::SetTrue)
                .help("Display the transactions left after replaying the journal."),
        )
        .arg(
            Arg::new("list")
                .short('l')
                .long("list")
                .action(ArgAction::SetTrue)
                .help("List deleted files that may be recovered."),
        )
        .arg(
            Arg::new("recover")
                .short('r')
                .long("recover")
                .value_parser(parse_count)
                .help("Recover 'all' deleted files or the N most recently deleted ones."),
        )
        .arg(
            Arg::new("outdir")
                .short('d')
                .long("outdir")
                .value_parser(clap::value_parser!(PathBuf))
                .default_value("recovered")
                .help("Directory receiving the recovered files."),
        )
        .arg(
            Arg::new("no-journal")
                .long("no-journal")
                .action(ArgAction::SetTrue)
                .help("Search the inode bitmaps instead of the journal (ext2)."),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_parser(clap::value_parser!(PathBuf))
                .help("JSON file overriding the recovery settings."),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("json")
                .short('j')
                .long("json")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let verbose = matches.get_flag("verbose");
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    // Both are required or defaulted by clap.
    let file_path = matches.get_one::<String>("body").cloned().unwrap_or_default();
    let format = matches.get_one::<String>("format").cloned().unwrap_or_default();
    let offset = matches.get_one::<u64>("offset").copied().unwrap_or(0);

    let config = match matches.get_one::<PathBuf>("config") {
        Some(path) => match RecoveryConfig::from_json_file(path) {
            Ok(config) => config,
            Err(err) => {
                error!("{}: {}", path.display(), err);
                std::process::exit(1);
            }
        },
        None => RecoveryConfig::default(),
    };

    let opts = Options {
        superblock: matches.get_flag("superblock"),
        inode: matches.get_one::<u64>("inode").copied(),
        groupdesc: matches.get_flag("groupdesc"),
        transactions: matches.get_flag("transactions"),
        list: matches.get_flag("list"),
        recover: matches.get_one::<RecoverCount>("recover").copied(),
        output_dir: matches
            .get_one::<PathBuf>("outdir")
            .cloned()
            .unwrap_or_else(|| PathBuf::from("recovered")),
        no_journal: matches.get_flag("no-journal"),
        json: matches.get_flag("json"),
    };

    process_partition(&file_path, &format, offset, config, &opts, verbose);
}
