//! `frostd --diagnostic`: check settings and collaborators without starting the engine

use colored::Colorize;

use crate::filesys::file::File;
use crate::runtime::DockerCli;
use crate::storage::settings::Settings;

fn report(check: &str, result: Result<String, String>) -> bool {
    match result {
        Ok(detail) => {
            println!("{} {}: {}", "[ok]".green().bold(), check, detail);
            true
        }
        Err(detail) => {
            println!("{} {}: {}", "[fail]".red().bold(), check, detail);
            false
        }
    }
}

/// Run every check and print a line per result. Returns whether all passed.
pub async fn run_diagnostic(settings_file: &File) -> bool {
    println!("{}", "Frost engine diagnostic".bold());

    let settings = match Settings::load(settings_file).await {
        Ok(settings) => settings,
        Err(e) => {
            report("settings", Err(e.to_string()));
            return false;
        }
    };

    let mut healthy = report(
        "settings",
        settings
            .validate()
            .map(|_| settings_file.path().display().to_string())
            .map_err(|e| e.to_string()),
    );

    let docker = DockerCli::new(settings.runtime.docker_bin.clone());
    healthy &= report(
        "docker",
        docker
            .ping()
            .await
            .map(|version| format!("server {}", version))
            .map_err(|e| e.to_string()),
    );

    let git = tokio::process::Command::new(&settings.runtime.git_bin)
        .arg("--version")
        .output()
        .await;
    healthy &= report(
        "git",
        match git {
            Ok(output) if output.status.success() => {
                Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
            }
            Ok(output) => Err(String::from_utf8_lossy(&output.stderr).trim().to_string()),
            Err(e) => Err(e.to_string()),
        },
    );

    let admin_url = format!("{}/config/", settings.proxy.admin_url.trim_end_matches('/'));
    let proxy = match reqwest::get(&admin_url).await {
        Ok(response) if response.status().is_success() => Ok(format!("reachable at {}", admin_url)),
        Ok(response) => Err(format!("{} returned {}", admin_url, response.status())),
        Err(e) => Err(format!("{} unreachable: {}", admin_url, e)),
    };
    healthy &= report("proxy", proxy);

    if healthy {
        println!("{}", "All checks passed".green());
    } else {
        println!("{}", "Some checks failed".yellow());
    }
    healthy
}
