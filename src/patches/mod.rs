//! The built-in patch set.
//!
//! Each function neutralises one image's GPU, baseband or logging
//! expectations. Symbol lookups and instruction scans that only exist on
//! some OS versions are downgraded to warnings; everything else aborts the
//! run before any byte is written.

use tracing::{info, warn};

use crate::arm64::{self, Assembler, MovzShift, Reg, DEFAULT_INST_LIMIT};
use crate::cache::{CacheAnalyser, Image, ImageMatcher};
use crate::error::Result;
use crate::patcher::Patcher;

/// Builds every patch into the queue. Nothing is written to disk here.
pub fn apply_all(
    analyser: &CacheAnalyser,
    patcher: &mut Patcher,
    unredact_logs: bool,
) -> Result<()> {
    let mut assembler = Assembler::new(patcher);

    apply_core_image(analyser, &mut assembler)?;
    apply_quartz_core(analyser, &mut assembler)?;
    apply_springboard_foundation(analyser, &mut assembler)?;
    apply_cm_capture(analyser, &mut assembler)?;
    apply_telephony_util(analyser, &mut assembler)?;
    apply_neutrino_core(analyser, &mut assembler)?;
    if unredact_logs {
        apply_libsystem_trace(analyser, &mut assembler)?;
    }

    Ok(())
}

/// Downgrades version-dependent lookup misses to a warning.
fn warn_if_recoverable(result: Result<()>, note: &str) -> Result<()> {
    match result {
        Err(e) if e.is_recoverable() => {
            warn!("{e} ({note}).");
            Ok(())
        }
        other => other,
    }
}

fn apply_core_image(analyser: &CacheAnalyser, asm: &mut Assembler) -> Result<()> {
    let image = analyser.find_image(&ImageMatcher::Framework("CoreImage"), false)?;

    // Force return false to allow software rendering.
    let mut gl_is_usable = image.resolve_sym(&["_CIGLIsUsable"])?;
    asm.write_movz_incr(
        image.path,
        image.header,
        &mut gl_is_usable,
        Reg::R0,
        false,
        0,
        MovzShift::Shift0,
    )?;
    asm.write_ret(image.path, image.header, gl_is_usable)?;

    // -- Supplemental SW rendering patches for iOS 16+ --

    // Allow widgets to use software rendering.
    warn_if_recoverable(
        (|| {
            let addr = image.resolve_sym(&["___isWidget_block_invoke"])?;
            asm.write_ret(image.path, image.header, addr)
        })(),
        "normal for iOS <= 16",
    )?;

    // Allow core UI to use software rendering.
    warn_if_recoverable(
        (|| {
            let start = image.resolve_sym(&["____ZL13isSWAllowListv_block_invoke"])?;
            let mut addr = arm64::find_cbz(image.data, image.header, start, true, false, 8)?;
            asm.write_nop_incr(image.path, image.header, &mut addr)?;
            let next = arm64::find_cbz(image.data, image.header, addr, false, false, 8)?;
            asm.write_nop(image.path, image.header, next)
        })(),
        "normal for iOS <= 16",
    )
}

/// iOS <= 14 has a missing null check on the return value of
/// `CA::OGL::AsynchronousDispatcher::renderer` in two callers; NOP the
/// call and the authenticated dispatch that consumes it. Later builds
/// already carry the null check (a wide CBZ right after the call) and are
/// left alone.
fn fix_async_dispatcher(
    image: &Image,
    asm: &mut Assembler,
    renderer: u64,
    sym: &str,
) -> Result<()> {
    let start = image.resolve_sym(&[sym])?;
    let mut renderer_call = arm64::find_bl_incr(
        image.data,
        image.header,
        start,
        Some(renderer),
        false,
        DEFAULT_INST_LIMIT,
    )?;

    match arm64::find_cbz(image.data, image.header, renderer_call, true, false, 1) {
        Ok(_) => {
            info!("Detected fixed `CA::OGL::AsynchronousDispatcher` logic, skipping `{sym}`.");
            Ok(())
        }
        Err(e) if e.is_recoverable() => {
            asm.write_nop_incr(image.path, image.header, &mut renderer_call)?;
            asm.write_nop_incr(image.path, image.header, &mut renderer_call)?;
            asm.write_nop_incr(image.path, image.header, &mut renderer_call)?;
            let blra = arm64::find_blra(
                image.data,
                image.header,
                renderer_call,
                true,
                false,
                false,
                4,
            )?;
            asm.write_nop(image.path, image.header, blra)
        }
        Err(e) => Err(e),
    }
}

fn apply_quartz_core(analyser: &CacheAnalyser, asm: &mut Assembler) -> Result<()> {
    let image = analyser.find_image(&ImageMatcher::Framework("QuartzCore"), false)?;

    let renderer = image.resolve_sym(&["__ZN2CA3OGL22AsynchronousDispatcher8rendererEv"])?;
    fix_async_dispatcher(
        &image,
        asm,
        renderer,
        "__ZN2CA3OGL22AsynchronousDispatcher10stop_timerEv",
    )?;
    fix_async_dispatcher(
        &image,
        asm,
        renderer,
        "__ZN2CA3OGLL17release_iosurfaceEP11__IOSurface",
    )?;

    // Neutralise CIF10 support, which also neutralises framebuffer AGX/SGX
    // compression.
    let cif10 = image.resolve_sym(&["___CADeviceSupportsCIF10_block_invoke"])?;
    asm.write_ret(image.path, image.header, cif10)
}

fn apply_springboard_foundation(analyser: &CacheAnalyser, asm: &mut Assembler) -> Result<()> {
    let image = analyser.find_image(&ImageMatcher::PrivateFramework("SpringBoardFoundation"), false)?;

    // Force return true, fixes wallpaper settings crash due to missing GPU.
    let mut addr = image.resolve_sym(&["+[SBFCARenderer shouldUseXPCServiceForRendering]"])?;
    asm.write_movz_incr(
        image.path,
        image.header,
        &mut addr,
        Reg::R0,
        false,
        1,
        MovzShift::Shift0,
    )?;
    asm.write_ret(image.path, image.header, addr)
}

fn apply_cm_capture(analyser: &CacheAnalyser, asm: &mut Assembler) -> Result<()> {
    let image = analyser.find_image(&ImageMatcher::PrivateFramework("CMCapture"), false)?;

    // Neutralise shader precompilation, which requires a GPU.
    warn_if_recoverable(
        (|| {
            let preload =
                image.resolve_sym(&["_FigPreloadShaders", "_FigCapturePreloadShaders"])?;
            asm.write_ret(image.path, image.header, preload)?;
            let wait = image.resolve_sym(&[
                "_FigWaitForPreloadShadersCompletion",
                "_FigCaptureWaitForPreloadShadersCompletion",
            ])?;
            asm.write_ret(image.path, image.header, wait)
        })(),
        "normal for iOS <= 14",
    )
}

fn apply_telephony_util(analyser: &CacheAnalyser, asm: &mut Assembler) -> Result<()> {
    let image = analyser.find_image(
        &ImageMatcher::Exact("/usr/lib/libTelephonyUtilDynamic.dylib"),
        false,
    )?;

    // Neutralise hardcoded expectations for Baseband.
    let determine_radio = image.resolve_sym(&["__TelephonyRadiosDetermineRadio"])?;
    asm.write_ret(image.path, image.header, determine_radio)?;

    for sym in ["_sTelephonyProduct", "_sTelephonyRadio", "_sTelephonyRadioVendor"] {
        let vm_addr = image.resolve_sym(&[sym])?;
        let (off, entry) = analyser.find_entry_from_vm_addr(vm_addr)?;
        asm.patcher().write(&entry.path, off, vec![0u8; 4]);
    }

    Ok(())
}

fn apply_neutrino_core(analyser: &CacheAnalyser, asm: &mut Assembler) -> Result<()> {
    let objc_image = analyser.find_image(&ImageMatcher::Exact("/usr/lib/libobjc.A.dylib"), false)?;
    let image = analyser.find_image(&ImageMatcher::PrivateFramework("NeutrinoCore"), true)?;

    // Replace the renderer factory's object creation with
    // `objc_alloc_init(NUSoftwareRenderer)`.
    let objc_alloc_init = objc_image.resolve_sym(&["_objc_alloc_init"])?;
    let nu_sw_renderer = image.resolve_objc_class("NUSoftwareRenderer")?;
    let mut address = image.resolve_sym(&[
        "-[NUDevice_iOS _newRendererWithCIContextOptions:error:]",
        "-[NUDevice_iOS _newRendererWithOptions:error:]",
    ])?;

    asm.write_adrp_add_incr(image.path, image.header, &mut address, nu_sw_renderer, Reg::R0)?;
    asm.write_adrp_add_incr(image.path, image.header, &mut address, objc_alloc_init, Reg::R1)?;
    asm.write_blr(image.path, image.header, address, Reg::R1)
}

fn apply_libsystem_trace(analyser: &CacheAnalyser, asm: &mut Assembler) -> Result<()> {
    let image = analyser.find_image(
        &ImageMatcher::Exact("/usr/lib/system/libsystem_trace.dylib"),
        false,
    )?;

    // Development builds log unredacted; pretend to be one.
    let mut addr = image.resolve_sym(&["__os_trace_is_development_build"])?;
    asm.write_movz_incr(
        image.path,
        image.header,
        &mut addr,
        Reg::R0,
        false,
        1,
        MovzShift::Shift0,
    )?;
    asm.write_ret(image.path, image.header, addr)
}
