//! Derived views over the tools collection: home page shelves and search.

use crate::record::Tool;

/// Category filters offered by the directory.
pub const CATEGORIES: [&str; 7] = ["All", "Writing", "Image", "Video", "Audio", "Coding", "Business"];

const SHELF_SIZE: usize = 4;
const CREATIVE: [&str; 4] = ["Image", "Video", "Audio", "Writing"];
const PRODUCTIVITY: [&str; 3] = ["Coding", "Business", "Analytics"];

/// Home page shelves, each capped at four tools.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCollections {
    pub featured: Vec<Tool>,
    pub free: Vec<Tool>,
    pub creative: Vec<Tool>,
    pub productivity: Vec<Tool>,
}

impl ToolCollections {
    /// Build shelves from tools in snapshot order. Tools without a price or a
    /// category are left off every shelf.
    pub fn from_tools(tools: &[Tool]) -> Self {
        let listable: Vec<&Tool> = tools
            .iter()
            .filter(|t| !t.price.is_empty() && !t.category.is_empty())
            .collect();

        let shelf = |keep: &dyn Fn(&Tool) -> bool| -> Vec<Tool> {
            listable
                .iter()
                .copied()
                .filter(|t| keep(t))
                .take(SHELF_SIZE)
                .cloned()
                .collect()
        };

        Self {
            featured: shelf(&|_| true),
            free: shelf(&|t| {
                let price = t.price.to_lowercase();
                price.contains("free") || price.contains("trial")
            }),
            creative: shelf(&|t| CREATIVE.contains(&t.category.as_str())),
            productivity: shelf(&|t| PRODUCTIVITY.contains(&t.category.as_str())),
        }
    }
}

/// Search box plus category selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolFilter {
    pub search: String,
    pub category: String,
}

impl Default for ToolFilter {
    fn default() -> Self {
        Self {
            search: String::new(),
            category: CATEGORIES[0].to_string(),
        }
    }
}

impl ToolFilter {
    pub fn new(search: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            search: search.into(),
            category: category.into(),
        }
    }

    /// No search term and no category: the home page shows shelves.
    pub fn is_unfiltered(&self) -> bool {
        self.search.is_empty() && self.category == CATEGORIES[0]
    }

    pub fn matches(&self, tool: &Tool) -> bool {
        let search = self.search.to_lowercase();
        let matches_search = tool.name.to_lowercase().contains(&search)
            || tool.description.to_lowercase().contains(&search);
        let matches_category = self.category == CATEGORIES[0]
            || tool
                .category
                .to_lowercase()
                .contains(&self.category.to_lowercase());
        matches_search && matches_category
    }

    pub fn apply<'a>(&self, tools: &'a [Tool]) -> Vec<&'a Tool> {
        tools.iter().filter(|t| self.matches(t)).collect()
    }
}
