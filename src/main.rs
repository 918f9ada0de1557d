//! Cross-Arb - Main Entry Point
//!
//! Continuous cross-venue arbitrage scanning with risk-gated execution.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cross_arb::config::Config;
use cross_arb::exchange::{
    build_adapter, ExchangeAdapter, Side, SymbolPair, VenueId, VenueRegistry,
};
use cross_arb::ledger::{
    Ledger, LedgerRead, LedgerWrite, PortfolioSnapshot, Position, PriceHistory, SqliteLedger,
    TradeRecord,
};
use cross_arb::market::{PriceAggregator, PriceTable};
use cross_arb::risk::{
    recommend_leverage, PositionSizer, ProposedTrade, RiskDecision, RiskGate, RiskProfile,
    SizingConfig,
};
use cross_arb::signal::{HoldOracle, MarketRegime, PredictionOracle};
use cross_arb::strategy::{
    ArbitrageExecutor, ExecutionOutcome, HedgeConfig, HedgePlanner, InstructionReason,
    OpportunityScanner, RebalanceConfig, RebalancePlanner, TradeInstruction,
};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Cross-Arb CLI
#[derive(Parser)]
#[command(name = "cross-arb")]
#[command(version, about = "Cross-venue crypto arbitrage with risk-gated execution")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one aggregation cycle and print ranked opportunities
    Scan,

    /// Run the continuous scan -> gate -> execute loop
    Run {
        /// Execute the single best opportunity each cycle (otherwise log only)
        #[arg(long)]
        execute: bool,
    },

    /// Show portfolio and recent arbitrage trades from the ledger
    Status {
        /// Path to the SQLite ledger (default: data/ledger.db)
        #[arg(short, long)]
        db: Option<String>,

        /// Show open position details
        #[arg(short, long)]
        verbose: bool,
    },
}

/// Counters for the run loop.
#[derive(Debug, Default)]
struct LoopMetrics {
    cycles: u64,
    opportunities: u64,
    executions: u64,
    risk_rejections: u64,
    partial_fills: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging()?;

    match cli.command {
        Commands::Scan => cmd_scan().await,
        Commands::Run { execute } => cmd_run(execute).await,
        Commands::Status { db, verbose } => cmd_status(db.as_deref(), verbose),
    }
}

/// Initialize stdout + rolling-file tracing.
fn init_logging() -> Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all("logs").ok();
    let file_appender = tracing_appender::rolling::daily("logs", "cross-arb.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .init();

    Ok(guard)
}

/// Everything the run loop needs, wired once at startup.
struct Engine {
    registry: Arc<VenueRegistry>,
    aggregator: Arc<PriceAggregator>,
    scanner: OpportunityScanner,
    executor: ArbitrageExecutor,
    gate: RiskGate,
    sizer: PositionSizer,
    rebalancer: RebalancePlanner,
    hedger: HedgePlanner,
    adapters: HashMap<VenueId, Arc<dyn ExchangeAdapter>>,
    ledger: Arc<SqliteLedger>,
    profile: RiskProfile,
    oracle: Arc<dyn PredictionOracle>,
}

/// Construct and wire all components from configuration.
///
/// Every dependency is passed explicitly; nothing is process-global.
fn build_engine(config: &Config) -> Result<Engine> {
    let symbols = config.watched_symbols()?;
    let profile = config.risk_profile()?;

    if let Some(parent) = Path::new(&config.ledger_path).parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let ledger = Arc::new(SqliteLedger::new(&config.ledger_path)?);

    let registry = Arc::new(VenueRegistry::from_configs(config.venues.clone())?);

    let mut adapters: HashMap<VenueId, Arc<dyn ExchangeAdapter>> = HashMap::new();
    for venue in registry.enabled() {
        adapters.insert(venue.id, build_adapter(venue)?);
    }

    let aggregator = Arc::new(PriceAggregator::new(
        adapters.values().cloned().collect(),
        symbols,
        config.aggregator.clone(),
        Some(Arc::clone(&ledger) as _),
    ));

    let scanner = OpportunityScanner::new(Arc::clone(&registry), config.scanner.clone());

    let gate = RiskGate::new(
        Arc::clone(&ledger) as _,
        config.risk.round_trip_fee,
        config.risk.check_fee_floor,
    );
    let sizer = PositionSizer::new(Arc::clone(&ledger) as _, SizingConfig::default());

    let executor = ArbitrageExecutor::new(
        adapters.clone(),
        Arc::clone(&aggregator),
        OpportunityScanner::new(Arc::clone(&registry), config.scanner.clone()),
        Arc::clone(&registry),
        RiskGate::new(
            Arc::clone(&ledger) as _,
            config.risk.round_trip_fee,
            config.risk.check_fee_floor,
        ),
        PositionSizer::new(Arc::clone(&ledger) as _, SizingConfig::default()),
        Arc::clone(&ledger) as Arc<dyn Ledger>,
        config.execution.clone(),
    );

    let rebalancer = RebalancePlanner::new(Arc::clone(&ledger) as _, RebalanceConfig::default());
    let hedger = HedgePlanner::new(Arc::clone(&ledger) as _, HedgeConfig::default());

    Ok(Engine {
        registry,
        aggregator,
        scanner,
        executor,
        gate,
        sizer,
        rebalancer,
        hedger,
        adapters,
        ledger,
        profile,
        // No trained model is wired in this build; the neutral oracle keeps
        // leverage recommendations at their floor.
        oracle: Arc::new(HoldOracle),
    })
}

/// One-shot scan: refresh, rank, print.
async fn cmd_scan() -> Result<()> {
    let config = Config::load()?;
    config.validate()?;
    let engine = build_engine(&config)?;

    let table = engine.aggregator.refresh().await;
    let opportunities = engine.scanner.scan(&table);

    if opportunities.is_empty() {
        println!("No opportunities above the profit threshold.");
        return Ok(());
    }

    println!(
        "{:<12} {:<10} {:<10} {:>12} {:>12} {:>8} {:>14}",
        "SYMBOL", "BUY", "SELL", "BUY PRICE", "SELL PRICE", "NET %", "MAX VOLUME"
    );
    for opp in &opportunities {
        println!(
            "{:<12} {:<10} {:<10} {:>12} {:>12} {:>8.4} {:>14}",
            opp.symbol.to_string(),
            opp.buy_venue.to_string(),
            opp.sell_venue.to_string(),
            opp.buy_price,
            opp.sell_price,
            opp.net_profit_pct,
            opp.max_volume,
        );
    }

    Ok(())
}

/// Continuous loop: refresh -> scan -> (execute) -> planner cadence.
async fn cmd_run(execute: bool) -> Result<()> {
    let config = Config::load()?;
    config.validate()?;
    let engine = build_engine(&config)?;
    let mut metrics = LoopMetrics::default();

    info!(
        venues = engine.registry.enabled_count(),
        symbols = engine.aggregator.symbols().len(),
        profile = %engine.profile.name,
        execute,
        "Starting run loop"
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!(
                    cycles = metrics.cycles,
                    opportunities = metrics.opportunities,
                    executions = metrics.executions,
                    risk_rejections = metrics.risk_rejections,
                    partial_fills = metrics.partial_fills,
                    "Shutting down"
                );
                return Ok(());
            }
            _ = run_cycle(&engine, &config, &mut metrics, execute) => {}
        }

        tokio::time::sleep(Duration::from_secs(config.scan_interval_secs)).await;
    }
}

async fn run_cycle(
    engine: &Engine,
    config: &Config,
    metrics: &mut LoopMetrics,
    execute: bool,
) {
    metrics.cycles += 1;

    let table = engine.aggregator.refresh().await;
    let opportunities = engine.scanner.scan(&table);
    metrics.opportunities += opportunities.len() as u64;

    for opp in opportunities.iter().take(3) {
        info!(
            symbol = %opp.symbol,
            buy = %opp.buy_venue,
            sell = %opp.sell_venue,
            net_pct = %opp.net_profit_pct,
            "Opportunity"
        );
    }

    if execute {
        if let Some(best) = opportunities.first() {
            match engine.executor.execute(best, None, &engine.profile).await {
                Ok(outcome) => {
                    match &outcome {
                        ExecutionOutcome::Completed { .. } => metrics.executions += 1,
                        ExecutionOutcome::RiskRejected { .. } => metrics.risk_rejections += 1,
                        ExecutionOutcome::PartialFill { .. } => metrics.partial_fills += 1,
                        _ => {}
                    }
                    info!(result = %outcome, "Execution attempt finished");
                }
                Err(e) => error!(error = %e, "Execution attempt errored"),
            }
        }
    }

    if metrics.cycles % config.planner_cadence_cycles == 0 {
        if let Err(e) = run_planners(engine, &table, execute).await {
            error!(error = %e, "Planner pass failed");
        }
    }
}

/// Periodic hedge/rebalance pass, funneled through the same risk gate and
/// order path as arbitrage.
async fn run_planners(engine: &Engine, table: &PriceTable, execute: bool) -> Result<()> {
    let snapshot = PortfolioSnapshot::capture(engine.ledger.as_ref())?;
    let positions = engine.ledger.positions()?;
    let prices = best_prices(table);
    let universe: Vec<SymbolPair> = engine.aggregator.symbols().to_vec();

    let mut instructions = engine.rebalancer.plan(&snapshot, &prices)?;
    instructions.extend(engine.hedger.plan_hedges(&positions, &universe)?);
    instructions.extend(engine.hedger.flash_crash_exits(&positions)?);

    for instruction in instructions {
        route_instruction(engine, &snapshot, table, &instruction, execute).await?;
    }

    Ok(())
}

/// Route one planner instruction: risk gate, sizing, then a single market
/// order on the venue with the best price for that side.
async fn route_instruction(
    engine: &Engine,
    snapshot: &PortfolioSnapshot,
    table: &PriceTable,
    instruction: &TradeInstruction,
    execute: bool,
) -> Result<()> {
    let Some((venue, price)) = pick_venue(table, &instruction.symbol, instruction.side) else {
        warn!(symbol = %instruction.symbol, "No venue quote for instruction; dropped");
        return Ok(());
    };

    // Protective exits fire at the planner's leverage; entries take the
    // regime- and confidence-aware recommendation.
    let leverage = if instruction.reason == InstructionReason::FlashCrashExit {
        instruction.leverage
    } else {
        planner_leverage(engine, &instruction.symbol, venue, snapshot.total_value)?
    };

    let proposed = ProposedTrade {
        symbol: instruction.symbol.clone(),
        side: instruction.side,
        quantity: instruction.quantity,
        price,
        leverage,
    };
    if let RiskDecision::Rejected(violation) =
        engine.gate.approve(&proposed, &engine.profile, snapshot)?
    {
        info!(
            symbol = %instruction.symbol,
            reason = %instruction.reason,
            %violation,
            "Planner instruction rejected by risk gate"
        );
        return Ok(());
    }

    // Protective exits fire at full size; entries pass through Kelly sizing.
    let quantity = if instruction.reason == InstructionReason::FlashCrashExit {
        instruction.quantity
    } else {
        engine.sizer.adjust_size(
            &instruction.symbol,
            instruction.quantity,
            price,
            &engine.profile,
            snapshot,
        )?
    };
    if quantity <= Decimal::ZERO {
        return Ok(());
    }

    if !execute {
        info!(
            symbol = %instruction.symbol,
            side = instruction.side.as_str(),
            %quantity,
            reason = %instruction.reason,
            "Planner instruction approved (dry run)"
        );
        return Ok(());
    }

    let adapter = engine
        .adapters
        .get(&venue)
        .context("adapter missing for picked venue")?;
    let fill = match instruction.side {
        Side::Buy => adapter.create_market_buy_order(&instruction.symbol, quantity).await,
        Side::Sell => adapter.create_market_sell_order(&instruction.symbol, quantity).await,
    };

    match fill {
        Ok(fill) => {
            engine.ledger.record_trade(&TradeRecord {
                symbol: instruction.symbol.clone(),
                venue,
                side: instruction.side,
                quantity: fill.filled_qty,
                price: fill.filled_price,
                executed_at: chrono::Utc::now(),
            })?;

            if instruction.reason == InstructionReason::FlashCrashExit {
                // Exit closes the position outright.
                engine.ledger.upsert_position(&Position {
                    symbol: instruction.symbol.clone(),
                    side: instruction.side.opposite(),
                    quantity: Decimal::ZERO,
                    entry_price: fill.filled_price,
                    stop_loss: None,
                    take_profit: None,
                    opened_at: chrono::Utc::now(),
                })?;
            }

            info!(
                symbol = %instruction.symbol,
                side = instruction.side.as_str(),
                qty = %fill.filled_qty,
                price = %fill.filled_price,
                reason = %instruction.reason,
                "Planner instruction executed"
            );
        }
        Err(e) => {
            warn!(
                symbol = %instruction.symbol,
                reason = %instruction.reason,
                error = %e,
                "Planner instruction failed"
            );
        }
    }

    Ok(())
}

/// Leverage for a planner entry: market regime from trailing closes plus the
/// opaque prediction signal, re-capped by the profile and portfolio tier.
fn planner_leverage(
    engine: &Engine,
    symbol: &SymbolPair,
    venue: VenueId,
    portfolio_value: Decimal,
) -> Result<Decimal> {
    let closes = engine.ledger.get_closes(symbol, 30)?;
    let regime = MarketRegime::classify(&closes);

    let confidence = match closes.last() {
        Some(close) => {
            let latest = cross_arb::exchange::Candle {
                symbol: symbol.clone(),
                venue,
                open: *close,
                high: *close,
                low: *close,
                close: *close,
                volume: Decimal::ZERO,
                timestamp: chrono::Utc::now(),
            };
            engine.oracle.predict(&latest).confidence
        }
        None => Decimal::ZERO,
    };

    Ok(recommend_leverage(
        confidence,
        regime,
        &engine.profile,
        portfolio_value,
    ))
}

/// Best executable price per symbol from the current cycle's table: lowest
/// ask for buys, highest bid for sells.
fn pick_venue(
    table: &PriceTable,
    symbol: &SymbolPair,
    side: Side,
) -> Option<(VenueId, Decimal)> {
    let venues = table.get(symbol)?;
    match side {
        Side::Buy => venues
            .values()
            .filter(|q| q.ask > Decimal::ZERO)
            .min_by(|a, b| a.ask.cmp(&b.ask))
            .map(|q| (q.venue, q.ask)),
        Side::Sell => venues
            .values()
            .filter(|q| q.bid > Decimal::ZERO)
            .max_by(|a, b| a.bid.cmp(&b.bid))
            .map(|q| (q.venue, q.bid)),
    }
}

/// Mid prices per symbol for rebalance sizing.
fn best_prices(table: &PriceTable) -> HashMap<SymbolPair, Decimal> {
    table
        .iter()
        .filter_map(|(symbol, venues)| {
            let mids: Vec<Decimal> = venues
                .values()
                .map(|q| q.mid())
                .filter(|m| *m > Decimal::ZERO)
                .collect();
            if mids.is_empty() {
                return None;
            }
            let sum: Decimal = mids.iter().copied().sum();
            Some((symbol.clone(), sum / Decimal::from(mids.len())))
        })
        .collect()
}

/// Print portfolio state from the ledger.
fn cmd_status(db: Option<&str>, verbose: bool) -> Result<()> {
    let path = match db {
        Some(path) => path.to_string(),
        None => Config::load()
            .map(|c| c.ledger_path)
            .unwrap_or_else(|_| "data/ledger.db".to_string()),
    };
    let ledger = SqliteLedger::new(&path)?;

    println!("Ledger: {}", path);
    println!("Cash balance:    {}", ledger.balance()?);
    println!("Portfolio value: {}", ledger.portfolio_value()?);

    let positions = ledger.positions()?;
    println!("Open positions:  {}", positions.len());
    if verbose {
        for p in &positions {
            println!(
                "  {} {} {} @ {} (stop {:?}, take {:?})",
                p.side.as_str(),
                p.quantity,
                p.symbol,
                p.entry_price,
                p.stop_loss,
                p.take_profit,
            );
        }
    }

    let trades = ledger.recent_arbitrage_trades(10)?;
    println!("Recent arbitrage trades:");
    for t in &trades {
        println!(
            "  {} {} {} -> {} qty {} status {} profit {}",
            t.trade_id,
            t.symbol,
            t.buy_venue,
            t.sell_venue,
            t.quantity,
            t.status.as_str(),
            t.realized_profit
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
        );
    }

    Ok(())
}
