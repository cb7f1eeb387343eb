//! Maps a request path to a snapshot pair (spec.md §4.8 endpoint table).

use pcm_aggregate::RING_CAPACITY;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Index,
    Metrics,
    PerSecond(u32),
    Dashboard,
    Favicon,
    NotFound,
}

pub fn route_for(path: &str) -> Route {
    match path {
        "/" => Route::Index,
        "/metrics" => Route::Metrics,
        "/persecond" => Route::PerSecond(1),
        "/dashboard" => Route::Dashboard,
        "/favicon.ico" => Route::Favicon,
        other => {
            if let Some(n) = other.strip_prefix("/persecond/") {
                match n.parse::<u32>() {
                    Ok(n) if (1..=RING_CAPACITY as u32).contains(&n) => Route::PerSecond(n),
                    _ => Route::NotFound,
                }
            } else {
                Route::NotFound
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persecond_bounds_are_enforced() {
        assert_eq!(route_for("/persecond/30"), Route::PerSecond(30));
        assert_eq!(route_for("/persecond/31"), Route::NotFound);
        assert_eq!(route_for("/persecond/0"), Route::NotFound);
    }

    #[test]
    fn known_paths_resolve() {
        assert_eq!(route_for("/"), Route::Index);
        assert_eq!(route_for("/metrics"), Route::Metrics);
        assert_eq!(route_for("/dashboard"), Route::Dashboard);
        assert_eq!(route_for("/nope"), Route::NotFound);
    }
}
