pub const INDEX_HTML: &str = include_str!("../../assets/index.html");
pub const GRID_HTML: &str = include_str!("../../assets/grid.html");
