use gridstamp::engine::template::TemplateStore;
use std::path::PathBuf;

fn main() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();
    let dir = match args.get(1) {
        Some(dir) => PathBuf::from(dir),
        None => return Err("usage: template_check <template-dir>".to_string()),
    };
    let store = TemplateStore::new(dir);
    let names = store.list().map_err(|err| err.to_string())?;

    let mut errors = Vec::new();
    let mut total_cells = 0u64;
    println!("template check: {}", store.dir().display());
    for name in &names {
        match store.get(name) {
            Ok(template) => {
                let bounds = template.bounds();
                total_cells += template.cell_count();
                println!(
                    "- {}: cells={}, bounds={} -> {}, origin={}, fingerprint={}",
                    name,
                    template.cell_count(),
                    bounds.min,
                    bounds.max,
                    template.origin(),
                    template.fingerprint()
                );
            }
            Err(err) => errors.push(format!("{}: {}", name, err)),
        }
    }

    println!("- templates: {}", names.len());
    println!("- loaded: {}", names.len() - errors.len());
    println!("- cells: {}", total_cells);
    println!("- errors: {}", errors.len());
    if !errors.is_empty() {
        println!("errors:");
        for error in errors {
            println!("- {}", error);
        }
        return Err("template errors detected".to_string());
    }
    Ok(())
}
