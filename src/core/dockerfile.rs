use crate::domain::model::{BuildRecipe, MODULE_PATH_VAR};

fn quote_json(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| format!("\"{}\"", s))
}

fn env_value(value: &str) -> String {
    if value.chars().any(|c| c.is_whitespace() || c == '"') {
        quote_json(value)
    } else {
        value.to_string()
    }
}

/// Render a recipe as the equivalent declarative Dockerfile.
pub fn render_dockerfile(recipe: &BuildRecipe) -> String {
    let mut lines = vec![format!("FROM {}", recipe.base_runtime), String::new()];

    lines.push(format!("COPY . {}", recipe.source.destination));
    lines.push(format!("WORKDIR {}", recipe.build_workdir));
    if recipe.upgrade_installer {
        lines.push("RUN pip install --upgrade pip".to_string());
    }
    lines.push(format!("RUN pip install --no-cache-dir -r {}", recipe.manifest));
    lines.push("RUN ls".to_string());
    lines.push(String::new());

    // PYTHONPATH goes last so it reads like the search path augmentation it is
    for (name, value) in recipe.environment.iter().filter(|(n, _)| *n != MODULE_PATH_VAR) {
        lines.push(format!("ENV {}={}", name, env_value(value)));
    }
    if let Some(module_path) = recipe.environment.get(MODULE_PATH_VAR) {
        lines.push(format!("ENV {}={}", MODULE_PATH_VAR, env_value(module_path)));
    }
    lines.push(String::new());

    lines.push(format!("WORKDIR {}", recipe.run_workdir));
    lines.push(format!("EXPOSE {}", recipe.port));
    let argv: Vec<String> = recipe.command.iter().map(|a| quote_json(a)).collect();
    lines.push(format!("CMD [{}]", argv.join(", ")));

    let mut rendered = lines.join("\n");
    rendered.push('\n');
    rendered
}
