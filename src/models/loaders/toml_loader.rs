use crate::error::{AppResult, FileError};
use crate::models::batch::BatchConfig;
use std::path::{Path, PathBuf};
use tokio::fs;

/// 从 TOML 文件加载批次配置
pub async fn load_batch_config(toml_file_path: &Path) -> AppResult<BatchConfig> {
    let path_display = toml_file_path.display().to_string();

    let content = fs::read_to_string(toml_file_path)
        .await
        .map_err(|e| FileError::ReadFailed {
            path: path_display.clone(),
            source: e,
        })?;

    let mut config: BatchConfig =
        toml::from_str(&content).map_err(|e| FileError::TomlParseFailed {
            path: path_display,
            source: e,
        })?;

    // 记录来源文件，创建成功后改名标记
    config.file_path = Some(toml_file_path.to_string_lossy().to_string());

    Ok(config)
}

/// 从文件夹中加载所有批次配置
///
/// 单个文件解析失败只记录警告，不影响其他文件
pub async fn load_all_batch_configs(folder_path: &str) -> AppResult<Vec<BatchConfig>> {
    let folder = PathBuf::from(folder_path);

    if !folder.exists() {
        return Err(FileError::DirectoryNotFound {
            path: folder_path.to_string(),
        }
        .into());
    }

    let mut entries = fs::read_dir(&folder)
        .await
        .map_err(|e| FileError::ReadFailed {
            path: folder_path.to_string(),
            source: e,
        })?;

    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) == Some("toml") {
            paths.push(path);
        }
    }
    // read_dir 的顺序不稳定
    paths.sort();

    let mut configs = Vec::new();
    for path in paths {
        tracing::info!(
            "正在加载批次配置: {}",
            path.file_name().unwrap_or_default().to_string_lossy()
        );

        match load_batch_config(&path).await {
            Ok(config) => {
                tracing::info!(
                    "成功加载批次 {}，共 {} 个文档",
                    config.name,
                    config.documents.len()
                );
                configs.push(config);
            }
            Err(e) => {
                tracing::warn!("加载文件失败 {}: {}", path.display(), e);
            }
        }
    }

    Ok(configs)
}
