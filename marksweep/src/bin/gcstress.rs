use clap::Parser as ClapParser;
use std::{process, sync::Arc};

use fnv::FnvHashSet;
use log::{debug, error, info};

use marksweep::{Collector, CollectorCreateInfo, GcConfig, KindId, RawPtr, RootSlots};

const FIELDS: usize = 4;

#[derive(ClapParser, Debug)]
#[command(author, version, about = "Random object graph stress test for the collector", long_about = None)]
struct Cli {
    /// Live objects kept in the graph
    #[arg(long, default_value_t = 10_000)]
    objects: usize,

    /// Collections to run
    #[arg(long, default_value_t = 20)]
    cycles: usize,

    /// Root slots
    #[arg(long, default_value_t = 16)]
    roots: usize,

    /// Marker threads, the collecting thread included
    #[arg(long)]
    markers: Option<usize>,

    /// Mark in bounded slices with the dirty block rescue pass
    #[arg(long)]
    incremental: bool,

    /// Report unreachable objects instead of reclaiming them
    #[arg(long)]
    find_leak: bool,

    /// Initial mark stack entries
    #[arg(long)]
    stack: Option<usize>,

    #[arg(long, default_value_t = 0x2545_f491)]
    seed: u64,
}

struct XorShift(u64);

impl XorShift {
    fn new(seed: u64) -> XorShift {
        XorShift(seed.max(1))
    }

    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next() % n.max(1) as u64) as usize
    }
}

struct Graph {
    collector: Collector,
    roots: Arc<RootSlots>,
    objects: Vec<RawPtr>,
    rng: XorShift,
}

impl Graph {
    fn refill(&mut self, target: usize) -> Result<(), String> {
        while self.objects.len() < target {
            let object = self
                .collector
                .allocate(KindId::NORMAL, FIELDS * marksweep::WORD)
                .map_err(|e| format!("allocation failed: {}", e))?;
            self.objects.push(object);
        }
        Ok(())
    }

    fn rewire(&mut self, edits: usize) -> Result<(), String> {
        for _ in 0..edits {
            let from = self.objects[self.rng.below(self.objects.len())];
            let field = self.rng.below(FIELDS);
            let value = match self.rng.below(4) {
                0 => 0,
                _ => self.objects[self.rng.below(self.objects.len())].as_word(),
            };
            self.collector
                .store(from, field, value)
                .map_err(|e| format!("store failed: {}", e))?;
        }

        for index in 0..self.roots.len() {
            let root = self.objects[self.rng.below(self.objects.len())];
            self.roots.set(index, Some(root));
        }
        Ok(())
    }

    /// Objects reachable from the root slots, found by walking the fields
    fn reachable(&self) -> Result<FnvHashSet<usize>, String> {
        let mut seen = FnvHashSet::default();
        let mut pending: Vec<RawPtr> = (0..self.roots.len())
            .filter_map(|index| self.roots.get(index))
            .collect();

        while let Some(object) = pending.pop() {
            if !seen.insert(object.as_word()) {
                continue;
            }
            for field in 0..FIELDS {
                let word = self
                    .collector
                    .load(object, field)
                    .map_err(|e| format!("load failed: {}", e))?;
                if let Some(next) = RawPtr::new(word) {
                    pending.push(next);
                }
            }
        }
        Ok(seen)
    }

    fn mark(&self) {
        self.collector.begin_cycle();
        let mut slices = 1;
        while !self.collector.advance_one_slice() {
            slices += 1;
        }
        debug!("Marked in {} slices", slices);
    }

    fn cycle(&mut self, number: usize, cli: &Cli) -> Result<(), String> {
        let edits = self.objects.len() / 4;
        self.rewire(edits)?;

        let expect = self.reachable()?;
        self.mark();

        let mut marked = FnvHashSet::default();
        self.collector
            .enumerate_reachable(|info| {
                marked.insert(info.address.as_word());
            });

        if marked != expect {
            let missing = expect.difference(&marked).count();
            let extra = marked.difference(&expect).count();
            return Err(format!(
                "cycle {}: {} reachable objects unmarked, {} unreachable objects marked",
                number, missing, extra
            ));
        }

        let report = self.collector.sweep(cli.find_leak);
        info!(
            "cycle {}: {} live, {} reclaimed, {} blocks released, {} leaks",
            number,
            marked.len(),
            report.objects_reclaimed,
            report.blocks_released,
            report.leaks.len()
        );

        if !cli.find_leak {
            self.objects.retain(|object| expect.contains(&object.as_word()));
        }
        self.refill(cli.objects.max(1))
    }
}

fn run(cli: &Cli) -> Result<(), String> {
    let mut info = CollectorCreateInfo::from_env();
    if cli.markers.is_some() {
        info.markers = cli.markers;
    }
    if cli.incremental {
        info.incremental = Some(true);
    }
    if cli.find_leak {
        info.find_leak = Some(true);
    }
    if cli.stack.is_some() {
        info.initial_mark_stack_size = cli.stack;
    }

    let collector = Collector::new(GcConfig::from_info(&info));
    let roots = Arc::new(RootSlots::new(cli.roots.max(1)));
    collector.add_roots(roots.clone());

    let mut graph = Graph {
        collector,
        roots,
        objects: Vec::with_capacity(cli.objects),
        rng: XorShift::new(cli.seed),
    };
    graph.refill(cli.objects.max(1))?;

    for number in 1..=cli.cycles {
        graph.cycle(number, cli)?;
    }

    let stats = graph.collector.stats();
    println!(
        "{} cycles: {} blocks, {} heap bytes, mark stack {} entries",
        stats.collections, stats.blocks, stats.heap_bytes, stats.mark_stack_size
    );
    Ok(())
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(&cli) {
        error!("{}", e);
        eprintln!("gcstress: {}", e);
        process::exit(1);
    }
}
