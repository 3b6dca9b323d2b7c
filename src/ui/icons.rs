pub struct Icons;

impl Icons {
    pub const ROCKET: &str = "🚀";
    pub const CHECK: &str = "✅";
    pub const CROSS: &str = "❌";
    pub const EYE: &str = "👀";
    pub const FILE: &str = "📄";
    pub const DEL: &str = "🗑️";
    pub const DATABASE: &str = "🗄️";
    pub const GEAR: &str = "⚙️";
}
