use anyhow::{bail, Context, Result};
use clap::Parser;
use futures::future::try_join_all;
use geo::Point;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use waybiker_graph::street_graph::{
    street_color, GraphSummary, RatedSource, StaticRatings, StreetRating,
};
use waybiker_graph::{GeoBounds, GraphConfig, GraphHandle, GraphService, GraphStore, NodeId, OverpassFetcher};

#[derive(Parser, Debug)]
#[command(name = "waybiker")]
#[command(about = "Load the street graph for an area and query it", long_about = None)]
struct Args {
    /// Viewport as south,west,north,east in degrees
    #[arg(long, value_parser = parse_bbox, allow_hyphen_values = true)]
    bbox: GeoBounds,

    /// JSON config file; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// JSON array of street ratings to attach to links
    #[arg(long)]
    ratings: Option<PathBuf>,

    /// Route to look up, as from_lat,from_lon:to_lat,to_lon (repeatable)
    #[arg(long = "route", value_parser = parse_route, allow_hyphen_values = true)]
    routes: Vec<(Point<f64>, Point<f64>)>,

    /// Overpass API endpoint
    #[arg(long)]
    overpass_url: Option<String>,

    /// Tile zoom level
    #[arg(long)]
    zoom: Option<u8>,

    /// Give up waiting for tiles after this many seconds
    #[arg(long, default_value = "120")]
    wait_secs: u64,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct RouteReport {
    from: (f64, f64),
    to: (f64, f64),
    nodes: Option<Vec<NodeId>>,
}

#[derive(Serialize)]
struct Report {
    summary: GraphSummary,
    rated_links: usize,
    fading_links: usize,
    /// Link count per display colour
    colors: Vec<(String, usize)>,
    routes: Vec<RouteReport>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = load_config(&args)?;

    let ratings = match &args.ratings {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading ratings from {}", path.display()))?;
            serde_json::from_str::<Vec<StreetRating>>(&text).context("parsing ratings")?
        }
        None => Vec::new(),
    };
    log::info!("Loaded {} rating(s)", ratings.len());

    let source = RatedSource::new(
        OverpassFetcher::new(&config),
        StaticRatings::new(ratings, config.zoom),
    );
    let (handle, task) = GraphService::spawn(GraphStore::from_config(&config), source, &config);

    let queued = handle.queue_viewport(args.bbox).await?;
    log::info!("Queued {} tile(s)", queued);

    let summary = handle
        .wait_until_idle(Duration::from_millis(250), Duration::from_secs(args.wait_secs))
        .await?;
    if !summary.idle {
        log::warn!(
            "Stopped waiting after {}s with {} tile(s) pending",
            args.wait_secs,
            summary.pending_tiles + summary.in_flight_tiles
        );
    }

    let routes = try_join_all(args.routes.iter().map(|&(from, to)| route(&handle, from, to))).await?;

    let (rated_links, fading_links, colors) = handle
        .read(|view| {
            let mut colors: Vec<(String, usize)> = Vec::new();
            let (mut rated, mut fading) = (0, 0);
            for link in view.links() {
                let rating = link.metadata.rating;
                rated += usize::from(rating.score.is_some());
                fading += usize::from(rating.fading);

                let color = street_color(rating.score);
                match colors.iter_mut().find(|(c, _)| *c == color) {
                    Some((_, count)) => *count += 1,
                    None => colors.push((color, 1)),
                }
            }
            colors.sort();
            (rated, fading, colors)
        })
        .await?;

    let report = Report {
        summary: handle.snapshot().await?,
        rated_links,
        fading_links,
        colors,
        routes,
    };

    handle.shutdown().await?;
    task.await.context("graph service task failed")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    Ok(())
}

fn load_config(args: &Args) -> Result<GraphConfig> {
    let mut config = match &args.config {
        Some(path) => GraphConfig::from_json_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => GraphConfig::default(),
    };

    if let Some(url) = &args.overpass_url {
        config.overpass_url = url.clone();
    }
    if let Some(zoom) = args.zoom {
        config.zoom = zoom;
    }
    config.validate()?;
    Ok(config)
}

/// Snap both ends to the nearest link node and search between them
async fn route(handle: &GraphHandle, from: Point<f64>, to: Point<f64>) -> Result<RouteReport> {
    let (start, end) = handle
        .read(move |view| (view.nearest_link_node(from), view.nearest_link_node(to)))
        .await?;

    let nodes = match (start, end) {
        (Some(start), Some(end)) => handle.shortest_path(start, end).await?,
        _ => None,
    };

    Ok(RouteReport {
        from: (from.y(), from.x()),
        to: (to.y(), to.x()),
        nodes,
    })
}

fn print_report(report: &Report) {
    let s = &report.summary;
    println!("Tiles loaded:  {} (zoom {})", s.tiles, s.zoom);
    println!("Ways / nodes:  {} / {}", s.ways, s.nodes);
    println!("Links:         {} ({} rated, {} fading)", s.links, report.rated_links, report.fading_links);
    if !s.idle {
        println!("Still pending: {} tile(s)", s.pending_tiles + s.in_flight_tiles);
    }
    for (color, count) in &report.colors {
        println!("  {} x{}", color, count);
    }

    for route in &report.routes {
        match &route.nodes {
            Some(nodes) => println!(
                "Route {:?} -> {:?}: {} node(s) {:?}",
                route.from,
                route.to,
                nodes.len(),
                nodes
            ),
            None => println!("Route {:?} -> {:?}: no path in loaded data", route.from, route.to),
        }
    }
}

fn parse_coords<const N: usize>(text: &str) -> Result<[f64; N]> {
    let values = text
        .split(',')
        .map(|part| part.trim().parse::<f64>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("invalid number in '{}'", text))?;

    values
        .try_into()
        .map_err(|v: Vec<f64>| anyhow::anyhow!("expected {} values, got {}", N, v.len()))
}

fn parse_bbox(text: &str) -> Result<GeoBounds> {
    let [south, west, north, east] = parse_coords::<4>(text)?;
    if south > north {
        bail!("south ({}) is above north ({})", south, north);
    }
    Ok(GeoBounds::new(south, west, north, east))
}

fn parse_route(text: &str) -> Result<(Point<f64>, Point<f64>)> {
    let Some((from, to)) = text.split_once(':') else {
        bail!("expected from_lat,from_lon:to_lat,to_lon");
    };
    let [from_lat, from_lon] = parse_coords::<2>(from)?;
    let [to_lat, to_lon] = parse_coords::<2>(to)?;
    Ok((Point::new(from_lon, from_lat), Point::new(to_lon, to_lat)))
}
