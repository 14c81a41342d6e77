fn main() {
    // 릴리스 빌드는 CI가 SCDL_RELEASE_VERSION을 태그 값으로 설정한다
    println!("cargo:rerun-if-env-changed=SCDL_RELEASE_VERSION");
    println!("cargo:rerun-if-env-changed=SCDL_LINUX_ASSET");

    let version = std::env::var("SCDL_RELEASE_VERSION")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| "dev".to_string());
    let linux_asset = std::env::var("SCDL_LINUX_ASSET")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| "scdl-web-linux-amd64.AppImage".to_string());

    println!("cargo:rustc-env=SCDL_BUILD_VERSION={}", version.trim());
    println!("cargo:rustc-env=SCDL_LINUX_ASSET={}", linux_asset.trim());

    #[cfg(windows)]
    {
        use std::path::PathBuf;

        let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") else {
            return;
        };
        let ico_path = PathBuf::from(&manifest_dir)
            .join("resources")
            .join("scdl-web.ico");

        // ICO 파일이 있을 때만 아이콘 리소스를 임베드
        if ico_path.exists() {
            let mut res = winres::WindowsResource::new();
            res.set_icon(&ico_path.to_string_lossy());

            if let Err(e) = res.compile() {
                println!("cargo:warning=Failed to compile resources: {}", e);
            }
        } else {
            println!(
                "cargo:warning=Icon file not found at {}; building without an embedded icon",
                ico_path.display()
            );
        }
    }
}
