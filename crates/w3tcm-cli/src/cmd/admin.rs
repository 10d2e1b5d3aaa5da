use anyhow::Result;
use w3tcm_context::site::Site;
use w3tcm_monitor::types::TemplateDecision;
use w3tcm_monitor::{unix_now, TemplateKey};

pub fn status(site: &Site) -> Result<()> {
    let store = site.open_store()?;
    let db = store.db();
    let mode = if site.config.auto_minify { "auto" } else { "manual" };
    println!("Mode: {mode}");
    if !site.config.monitor_filters.is_empty() {
        let filters: Vec<&str> = site.config.monitor_filters.iter().map(String::as_str).collect();
        println!("Traced: {}", filters.join(", "));
    }

    println!("\nTemplates:");
    for (theme, templates) in &db.data {
        for template in templates.keys() {
            let key = TemplateKey::new(theme.as_str(), template.as_str());
            let decision = match TemplateDecision::of(db.entry(&key)) {
                TemplateDecision::Pending => "pending",
                TemplateDecision::Minify => "minify",
                TemplateDecision::DoNotMinify => "do-not-minify",
            };
            println!("  {key}: {decision}");
        }
    }

    if !db.notices.is_empty() {
        println!("\nNotices:");
        for notice in &db.notices {
            println!("  {notice}");
        }
    }
    Ok(())
}

pub fn reset(site: &Site) -> Result<()> {
    site.reset()?;
    println!("Store and generated configuration cleared.");
    Ok(())
}

pub fn toggle_auto(mut site: Site) -> Result<()> {
    let on = site.toggle_auto_minify()?;
    println!("Auto minify is {}.", if on { "on" } else { "off" });
    Ok(())
}

pub fn monitor_filter(mut site: Site, filter: &str, on: bool) -> Result<()> {
    site.set_monitor_filter(filter, on)?;
    println!("FILTER::{filter} {}", if on { "traced" } else { "not traced" });
    Ok(())
}

pub fn clear_monitor(mut site: Site) -> Result<()> {
    site.clear_monitor()?;
    println!("All filters cleared.");
    Ok(())
}

pub fn skip_template(
    site: &Site,
    theme: &str,
    template: &str,
    notice_id: &str,
    skip: bool,
) -> Result<()> {
    let mut store = site.open_store()?;
    let key = TemplateKey::new(theme, template);
    site.builder()
        .set_template_skip(store.db_mut(), &key, notice_id, skip, unix_now())?;
    store.save()?;
    println!(
        "Template {key} will {}be minified.",
        if skip { "not " } else { "" }
    );
    Ok(())
}

pub fn purge(site: &Site) -> Result<()> {
    let removed = site.purge()?;
    println!("Removed {removed} inline script file(s).");
    Ok(())
}
